//! # beacon-settings
//!
//! Configuration with layered sources:
//! 1. **Compiled defaults**: [`BeaconSettings::default()`]
//! 2. **Settings file**: `~/.beacon/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment**: `BEACON_*` overrides (highest priority)
//!
//! ```no_run
//! use beacon_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("listening on {}", settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, beacon_home, deep_merge, load_settings, load_settings_from_path,
    resolve_path, settings_path,
};
pub use types::*;
