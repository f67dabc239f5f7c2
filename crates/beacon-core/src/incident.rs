use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::geo::Coordinate;
use crate::ids::IncidentId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    InProgress,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "in_progress" => Some(Self::InProgress),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A reported incident as held by the record store.
///
/// The router receives it by value and only reads `coordinate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentEvent {
    pub id: IncidentId,
    pub coordinate: Coordinate,
    pub category: String,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for reporting an incident.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncident {
    pub lat: f64,
    pub lng: f64,
    pub category: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub contact: Option<String>,
}

impl NewIncident {
    pub fn coordinate(&self) -> Result<Coordinate, CoreError> {
        Coordinate::new(self.lat, self.lng)
    }
}

/// Partial update applied to a stored incident.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentPatch {
    #[serde(default)]
    pub status: Option<IncidentStatus>,
    #[serde(default)]
    pub note: Option<String>,
}

impl IncidentPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.note.is_none()
    }
}
