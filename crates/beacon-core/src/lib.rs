//! # beacon-core
//!
//! Shared vocabulary for the beacon relay:
//!
//! - **Branded IDs**: `ConnectionId`, `IncidentId`, `SubscriberId`, `RoomId`
//! - **Geo**: validated `Coordinate`, haversine `distance_km`, `bounding_box`
//! - **Incidents**: `IncidentEvent`, `NewIncident`, `IncidentPatch`
//! - **Protocol**: `InboundFrame` decoding and `OutboundEvent` encoding
//! - **Errors**: `CoreError` and `DecodeError` via `thiserror`

#![deny(unsafe_code)]

pub mod errors;
pub mod geo;
pub mod ids;
pub mod incident;
pub mod protocol;
pub mod roles;
