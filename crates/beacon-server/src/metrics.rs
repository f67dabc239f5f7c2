//! Metric names recorded by the relay.

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections closed by the idle sweep (counter).
pub const WS_IDLE_CLOSED_TOTAL: &str = "ws_idle_closed_total";
/// Fan-out recipients selected (counter, labels: `scope`).
pub const FANOUT_RECIPIENTS_TOTAL: &str = "fanout_recipients_total";
/// Entries pruned after a failed write (counter, labels: `scope`).
pub const FANOUT_PRUNED_TOTAL: &str = "fanout_pruned_total";
/// Wall time of one fan-out pass (histogram, labels: `scope`).
pub const FANOUT_DURATION_SECONDS: &str = "fanout_duration_seconds";
/// Signaling frames forwarded (counter, labels: `kind`).
pub const SIGNAL_RELAYED_TOTAL: &str = "signal_relayed_total";
/// Signaling frames whose target was gone (counter, labels: `kind`).
pub const SIGNAL_DROPPED_TOTAL: &str = "signal_dropped_total";
/// Inbound frames dropped at decode or auth (counter, labels: `reason`).
pub const FRAMES_REJECTED_TOTAL: &str = "frames_rejected_total";
/// Push notifications handed to the push collaborator (counter).
pub const PUSH_REQUESTS_TOTAL: &str = "push_requests_total";
