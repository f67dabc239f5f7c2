//! # beacon-server
//!
//! WebSocket relay for neighbourhood incident alerts. Connections register a
//! role and location, incidents are fanned out to community members within a
//! radius and to responders, and call rooms relay WebRTC signaling between
//! peers. The HTTP surface reports and updates incidents.

pub mod alerts;
pub mod broker;
pub mod collab;
pub mod connection;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub use alerts::{AlertReport, AlertService};
pub use collab::{push_from_settings, Authenticator, IncidentStore, PushNotifier, StaticTokenAuth};
pub use errors::ServerError;
pub use gateway::Gateway;
pub use server::{build_router, start, AppState, Collaborators, ServerConfig, ServerHandle};
