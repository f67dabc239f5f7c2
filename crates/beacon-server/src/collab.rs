//! Collaborators the relay consumes but does not own: incident storage,
//! token verification and push delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::geo::Coordinate;
use beacon_core::ids::{IncidentId, SubscriberId};
use beacon_core::incident::{IncidentEvent, IncidentPatch, NewIncident};
use beacon_core::roles::Role;
use beacon_settings::{AuthSettings, PushSettings};
use beacon_store::{IncidentRepo, StoreError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::ServerError;

/// Incident persistence.
pub trait IncidentStore: Send + Sync {
    fn create_incident(&self, input: &NewIncident) -> Result<IncidentEvent, StoreError>;
    /// `None` when no incident has this id.
    fn update_incident(
        &self,
        id: &IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<IncidentEvent>, StoreError>;
    fn active_incidents(&self) -> Result<Vec<IncidentEvent>, StoreError>;
}

impl IncidentStore for IncidentRepo {
    fn create_incident(&self, input: &NewIncident) -> Result<IncidentEvent, StoreError> {
        self.create(input)
    }

    fn update_incident(
        &self,
        id: &IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<IncidentEvent>, StoreError> {
        self.update(id, patch)
    }

    fn active_incidents(&self) -> Result<Vec<IncidentEvent>, StoreError> {
        self.active()
    }
}

/// Who a verified token belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subscriber_id: SubscriberId,
    pub role: Role,
}

pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from settings.
#[derive(Debug, Default)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuth {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let tokens = settings
            .tokens
            .iter()
            .map(|(token, grant)| {
                (
                    token.clone(),
                    Identity {
                        subscriber_id: SubscriberId::from_raw(grant.subscriber_id.clone()),
                        role: grant.role,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokenAuth {
    fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// Best-effort delivery to devices without a live connection. Never fails
/// the caller; implementations log their own errors.
pub trait PushNotifier: Send + Sync {
    fn notify_nearby(&self, coordinate: Coordinate, radius_km: f64, payload: Value);
}

/// Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct NoopPush;

impl PushNotifier for NoopPush {
    fn notify_nearby(&self, coordinate: Coordinate, radius_km: f64, _payload: Value) {
        debug!(lat = coordinate.lat(), lng = coordinate.lng(), radius_km, "push disabled, skipping");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody {
    lat: f64,
    lng: f64,
    radius_km: f64,
    payload: Value,
}

/// POSTs each notification as JSON to a configured URL.
pub struct WebhookPush {
    url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for WebhookPush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookPush")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookPush {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ServerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("beacon/0.1")
            .build()
            .map_err(|e| ServerError::PushClient(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl PushNotifier for WebhookPush {
    fn notify_nearby(&self, coordinate: Coordinate, radius_km: f64, payload: Value) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(url = %self.url, "no async runtime, push skipped");
            return;
        };
        let body = WebhookBody {
            lat: coordinate.lat(),
            lng: coordinate.lng(),
            radius_km,
            payload,
        };
        let request = self.client.post(&self.url).json(&body);
        let url = self.url.clone();

        let _ = runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, status = resp.status().as_u16(), "push delivered");
                }
                Ok(resp) => {
                    warn!(url = %url, status = resp.status().as_u16(), "push rejected");
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "push request failed");
                }
            }
        });
    }
}

/// Webhook push when a URL is configured, otherwise a no-op.
pub fn push_from_settings(settings: &PushSettings) -> Result<Arc<dyn PushNotifier>, ServerError> {
    match settings.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            info!(url, "push webhook configured");
            Ok(Arc::new(WebhookPush::new(
                url,
                Duration::from_secs(settings.timeout_secs),
            )?))
        }
        None => Ok(Arc::new(NoopPush)),
    }
}
