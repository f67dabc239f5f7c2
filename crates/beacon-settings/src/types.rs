//! Settings type definitions.
//!
//! Every section is `#[serde(default)]`, so a settings file only needs the
//! keys it changes. Field names are camelCase on disk.

use std::collections::HashMap;

use beacon_core::roles::Role;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_RADIUS_KM: f64 = 0.2;

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconSettings {
    pub server: ServerSettings,
    pub fanout: FanoutSettings,
    pub push: PushSettings,
    pub auth: AuthSettings,
    pub telemetry: TelemetrySettings,
    pub store: StoreSettings,
}

impl BeaconSettings {
    /// Replace values that would break the relay with their defaults.
    pub fn validate(&mut self) {
        let radius = self.fanout.radius_km;
        if !radius.is_finite() || radius <= 0.0 {
            warn!(radius_km = radius, "invalid fan-out radius, using default");
            self.fanout.radius_km = DEFAULT_RADIUS_KM;
        }
        if self.server.max_send_queue == 0 {
            warn!("maxSendQueue must be at least 1");
            self.server.max_send_queue = 1;
        }
        if self.server.max_send_drops == 0 {
            warn!("maxSendDrops must be at least 1");
            self.server.max_send_drops = 1;
        }
        if self.server.sweep_interval_secs == 0 {
            self.server.sweep_interval_secs = ServerSettings::default().sweep_interval_secs;
        }
        if self.server.idle_timeout_secs == 0 {
            self.server.idle_timeout_secs = ServerSettings::default().idle_timeout_secs;
        }
        if self.push.timeout_secs == 0 {
            self.push.timeout_secs = PushSettings::default().timeout_secs;
        }
    }
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Outbound queue depth per connection.
    pub max_send_queue: usize,
    /// Full-queue drops tolerated before a slow connection is pruned.
    pub max_send_drops: u64,
    /// Connections silent for longer than this are closed by the sweep.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            max_send_drops: 100,
            idle_timeout_secs: 90,
            sweep_interval_secs: 30,
        }
    }
}

/// Incident fan-out policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Radius around an incident that community connections are alerted in.
    pub radius_km: f64,
    /// Also alert every responder regardless of distance.
    pub notify_responders: bool,
    /// Hand each incident to the push collaborator.
    pub push_enabled: bool,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_RADIUS_KM,
            notify_responders: true,
            push_enabled: true,
        }
    }
}

/// Push delivery to disconnected devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Webhook receiving `notify_nearby` payloads. Push is a no-op when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

/// Identity granted to a static token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub subscriber_id: String,
    pub role: Role,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub tokens: HashMap<String, TokenGrant>,
    /// Drop `register` frames that do not carry a valid token.
    pub require_token: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Persist WARN+ events to SQLite.
    pub log_to_sqlite: bool,
    /// Relative paths resolve under `~/.beacon`.
    pub log_db_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: false,
            log_db_path: "logs.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Incident database. Relative paths resolve under `~/.beacon`.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "beacon.db".to_string(),
        }
    }
}
