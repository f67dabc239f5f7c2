use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use tracing::instrument;

use beacon_core::geo::Coordinate;
use beacon_core::ids::IncidentId;
use beacon_core::incident::{IncidentEvent, IncidentPatch, IncidentStatus, NewIncident};

use crate::database::Database;
use crate::error::StoreError;

const SELECT_COLUMNS: &str =
    "SELECT id, lat, lng, category, note, contact, status, created_at, updated_at FROM incidents";

/// Column values as read, before domain validation.
struct IncidentRow {
    id: String,
    lat: f64,
    lng: f64,
    category: String,
    note: String,
    contact: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl IncidentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            lat: row.get(1)?,
            lng: row.get(2)?,
            category: row.get(3)?,
            note: row.get(4)?,
            contact: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_event(self) -> Result<IncidentEvent, StoreError> {
        let coordinate = Coordinate::new(self.lat, self.lng).map_err(|e| StoreError::CorruptRow {
            table: "incidents",
            column: "lat/lng",
            detail: e.to_string(),
        })?;
        let status = IncidentStatus::parse(&self.status).ok_or_else(|| StoreError::CorruptRow {
            table: "incidents",
            column: "status",
            detail: format!("unknown status '{}'", self.status),
        })?;
        Ok(IncidentEvent {
            id: IncidentId::from_raw(self.id),
            coordinate,
            category: self.category,
            note: self.note,
            contact: self.contact,
            status,
            created_at: parse_time(&self.created_at, "created_at")?,
            updated_at: parse_time(&self.updated_at, "updated_at")?,
        })
    }
}

fn parse_time(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "incidents",
            column,
            detail: e.to_string(),
        })
}

/// Incident records: create, patch, and list the ones not yet resolved.
#[derive(Clone)]
pub struct IncidentRepo {
    db: Database,
}

impl IncidentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(category = %input.category))]
    pub fn create(&self, input: &NewIncident) -> Result<IncidentEvent, StoreError> {
        let coordinate = input.coordinate()?;
        if input.category.trim().is_empty() {
            return Err(StoreError::InvalidInput("category must not be empty".into()));
        }

        let now = Utc::now();
        let event = IncidentEvent {
            id: IncidentId::new(),
            coordinate,
            category: input.category.clone(),
            note: input.note.clone(),
            contact: input.contact.clone(),
            status: IncidentStatus::Active,
            created_at: now,
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO incidents (id, lat, lng, category, note, contact, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    event.id.as_str(),
                    coordinate.lat(),
                    coordinate.lng(),
                    event.category,
                    event.note,
                    event.contact,
                    event.status.as_str(),
                    event.created_at.to_rfc3339(),
                    event.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(event)
    }

    #[instrument(skip(self), fields(incident_id = %id))]
    pub fn get(&self, id: &IncidentId) -> Result<Option<IncidentEvent>, StoreError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    [id.as_str()],
                    IncidentRow::read,
                )
                .optional()?)
        })?;
        row.map(IncidentRow::into_event).transpose()
    }

    /// Apply a patch. `None` when no incident has this id.
    #[instrument(skip(self, patch), fields(incident_id = %id))]
    pub fn update(
        &self,
        id: &IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<IncidentEvent>, StoreError> {
        if patch.is_empty() {
            return self.get(id);
        }

        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE incidents
                 SET status = COALESCE(?2, status), note = COALESCE(?3, note), updated_at = ?4
                 WHERE id = ?1",
                rusqlite::params![
                    id.as_str(),
                    patch.status.map(|s| s.as_str()),
                    patch.note,
                    Utc::now().to_rfc3339(),
                ],
            )?)
        })?;

        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// Incidents not yet resolved, newest first.
    #[instrument(skip(self))]
    pub fn active(&self) -> Result<Vec<IncidentEvent>, StoreError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE status != 'resolved' ORDER BY rowid DESC"
            ))?;
            let rows = stmt
                .query_map([], IncidentRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(IncidentRow::into_event).collect()
    }
}
