use serde::{Deserialize, Serialize};
use std::fmt;

/// Presence role a connection declares on `register`.
///
/// Incident fan-out targets `Community`; `Responder` receives every
/// incident regardless of distance.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Responder,
    #[serde(alias = "reporter", alias = "subscriber")]
    Community,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Responder => "responder",
            Self::Community => "community",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a connection plays inside a call room.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Responder,
}

impl CallRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
