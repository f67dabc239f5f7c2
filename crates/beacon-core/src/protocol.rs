//! Wire frames exchanged over the persistent connection.
//!
//! Inbound frames are decoded once into [`InboundFrame`]; nothing downstream
//! of the gateway sees raw JSON. Outbound events are the closed set in
//! [`OutboundEvent`], tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DecodeError;
use crate::geo::Coordinate;
use crate::ids::{ConnectionId, RoomId, SubscriberId};
use crate::incident::IncidentEvent;
use crate::roles::{CallRole, Role};

/// Which signaling message a relay carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Frame `type` used on the wire in both directions.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Offer => "signal-offer",
            Self::Answer => "signal-answer",
            Self::IceCandidate => "signal-ice",
        }
    }
}

/// A decoded client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Register {
        role: Role,
        coordinate: Option<Coordinate>,
        subscriber_id: Option<SubscriberId>,
        token: Option<String>,
    },
    LocationUpdate {
        coordinate: Coordinate,
    },
    Heartbeat,
    JoinCall {
        room_id: RoomId,
        role: CallRole,
        subscriber_id: Option<SubscriberId>,
    },
    Signal {
        kind: SignalKind,
        to: ConnectionId,
        payload: Value,
    },
    LeaveCall,
}

impl InboundFrame {
    /// Frame kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::LocationUpdate { .. } => "location-update",
            Self::Heartbeat => "heartbeat",
            Self::JoinCall { .. } => "join-call",
            Self::Signal { kind, .. } => kind.wire_type(),
            Self::LeaveCall => "leave-call",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    role: Role,
    lat: Option<f64>,
    lng: Option<f64>,
    subscriber_id: Option<SubscriberId>,
    token: Option<String>,
}

#[derive(Deserialize)]
struct LocationBody {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinCallBody {
    room_id: RoomId,
    role: CallRole,
    subscriber_id: Option<SubscriberId>,
}

#[derive(Deserialize)]
struct SignalBody {
    to: ConnectionId,
    payload: Value,
}

fn body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn signal(kind: SignalKind, value: Value) -> Result<InboundFrame, DecodeError> {
    let SignalBody { to, payload } = body(value)?;
    Ok(InboundFrame::Signal { kind, to, payload })
}

/// Decode one text frame.
///
/// The `type` tag is checked before the body so an unrecognised kind is
/// reported as [`DecodeError::UnknownKind`] rather than malformed input.
pub fn decode(raw: &str) -> Result<InboundFrame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DecodeError::Malformed("`type` is not a string".into())),
        None if value.is_object() => return Err(DecodeError::Malformed("missing `type`".into())),
        None => return Err(DecodeError::Malformed("frame is not an object".into())),
    };

    match kind.as_str() {
        "register" => {
            let b: RegisterBody = body(value)?;
            Ok(InboundFrame::Register {
                role: b.role,
                coordinate: Coordinate::from_parts(b.lat, b.lng)?,
                subscriber_id: b.subscriber_id,
                token: b.token,
            })
        }
        "location-update" | "update-location" => {
            let b: LocationBody = body(value)?;
            Ok(InboundFrame::LocationUpdate {
                coordinate: Coordinate::new(b.lat, b.lng)?,
            })
        }
        "heartbeat" => Ok(InboundFrame::Heartbeat),
        "join-call" => {
            let b: JoinCallBody = body(value)?;
            Ok(InboundFrame::JoinCall {
                room_id: b.room_id,
                role: b.role,
                subscriber_id: b.subscriber_id,
            })
        }
        "signal-offer" => signal(SignalKind::Offer, value),
        "signal-answer" => signal(SignalKind::Answer, value),
        "signal-ice" => signal(SignalKind::IceCandidate, value),
        "leave-call" => Ok(InboundFrame::LeaveCall),
        _ => Err(DecodeError::UnknownKind(kind)),
    }
}

/// Server-to-client events.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },

    #[serde(rename = "incident-new", rename_all = "camelCase")]
    IncidentNew {
        event: IncidentEvent,
        /// Absent for role-wide notifications that ignore distance.
        #[serde(skip_serializing_if = "Option::is_none")]
        distance_km: Option<f64>,
    },

    #[serde(rename = "incident-updated")]
    IncidentUpdated { event: IncidentEvent },

    #[serde(rename = "peer-joined", rename_all = "camelCase")]
    PeerJoined {
        connection_id: ConnectionId,
        role: CallRole,
    },

    #[serde(rename = "peer-left", rename_all = "camelCase")]
    PeerLeft {
        connection_id: ConnectionId,
        role: CallRole,
    },

    #[serde(rename = "invite", rename_all = "camelCase")]
    Invite { peer_id: ConnectionId },

    #[serde(rename = "signal-offer")]
    SignalOffer { from: ConnectionId, payload: Value },

    #[serde(rename = "signal-answer")]
    SignalAnswer { from: ConnectionId, payload: Value },

    #[serde(rename = "signal-ice")]
    SignalIce { from: ConnectionId, payload: Value },

    #[serde(rename = "heartbeat-ack")]
    HeartbeatAck,
}

impl OutboundEvent {
    /// Relay form of a signaling frame: same payload, sender attached.
    pub fn signal(kind: SignalKind, from: ConnectionId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => Self::SignalOffer { from, payload },
            SignalKind::Answer => Self::SignalAnswer { from, payload },
            SignalKind::IceCandidate => Self::SignalIce { from, payload },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
