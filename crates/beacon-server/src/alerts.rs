//! Incident reporting: persist, fan out to nearby community members, alert
//! responders, and hand off to push.

use std::sync::Arc;

use beacon_core::ids::IncidentId;
use beacon_core::incident::{IncidentEvent, IncidentPatch, NewIncident};
use beacon_core::protocol::OutboundEvent;
use beacon_core::roles::Role;
use beacon_settings::FanoutSettings;
use beacon_telemetry::MetricsRecorder;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::collab::{IncidentStore, PushNotifier};
use crate::errors::ServerError;
use crate::metrics::PUSH_REQUESTS_TOTAL;
use crate::router::FanoutRouter;

/// What `report` did with a new incident.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertReport {
    pub incident: IncidentEvent,
    pub radius_km: f64,
    pub nearby: usize,
    pub delivered: usize,
    pub pruned: usize,
    pub responders_notified: usize,
}

pub struct AlertService {
    store: Arc<dyn IncidentStore>,
    router: Arc<FanoutRouter>,
    push: Arc<dyn PushNotifier>,
    fanout: FanoutSettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl AlertService {
    pub fn new(
        store: Arc<dyn IncidentStore>,
        router: Arc<FanoutRouter>,
        push: Arc<dyn PushNotifier>,
        fanout: FanoutSettings,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            store,
            router,
            push,
            fanout,
            metrics,
        }
    }

    /// Store a new incident and alert everyone who should hear about it.
    /// `radius_km` overrides the configured radius when positive and finite.
    #[instrument(skip(self, input), fields(category = %input.category))]
    pub fn report(
        &self,
        input: &NewIncident,
        radius_km: Option<f64>,
    ) -> Result<AlertReport, ServerError> {
        let radius_km = radius_km
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(self.fanout.radius_km);
        let incident = self.store.create_incident(input)?;

        let nearby = self.router.fan_out_incident(&incident, radius_km);

        let responders_notified = if self.fanout.notify_responders {
            self.router
                .notify_role(
                    Role::Responder,
                    &OutboundEvent::IncidentNew {
                        event: incident.clone(),
                        distance_km: None,
                    },
                )
                .delivered
        } else {
            0
        };

        if self.fanout.push_enabled {
            match serde_json::to_value(&incident) {
                Ok(payload) => {
                    self.push.notify_nearby(incident.coordinate, radius_km, payload);
                    if let Some(m) = &self.metrics {
                        m.counter_inc(PUSH_REQUESTS_TOTAL, &[], 1);
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode push payload"),
            }
        }

        info!(
            incident_id = %incident.id,
            radius_km,
            nearby = nearby.recipients,
            delivered = nearby.delivered,
            pruned = nearby.pruned,
            responders_notified,
            "incident reported"
        );

        Ok(AlertReport {
            incident,
            radius_km,
            nearby: nearby.recipients,
            delivered: nearby.delivered,
            pruned: nearby.pruned,
            responders_notified,
        })
    }

    /// Apply a patch and broadcast `incident-updated` to every connection.
    /// `None` when the incident does not exist.
    #[instrument(skip(self, patch), fields(incident_id = %id))]
    pub fn update(
        &self,
        id: &IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<IncidentEvent>, ServerError> {
        let Some(event) = self.store.update_incident(id, patch)? else {
            return Ok(None);
        };
        let report = self.router.broadcast_all(&OutboundEvent::IncidentUpdated {
            event: event.clone(),
        });
        info!(
            status = %event.status.as_str(),
            recipients = report.recipients,
            "incident updated"
        );
        Ok(Some(event))
    }

    pub fn active(&self) -> Result<Vec<IncidentEvent>, ServerError> {
        Ok(self.store.active_incidents()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::registry::ConnectionRegistry;
    use beacon_core::geo::Coordinate;
    use beacon_core::incident::IncidentStatus;
    use beacon_store::{Database, IncidentRepo, StoreError};
    use parking_lot::Mutex;
    use serde_json::Value;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingPush {
        calls: Mutex<Vec<(Coordinate, f64, Value)>>,
    }

    impl PushNotifier for RecordingPush {
        fn notify_nearby(&self, coordinate: Coordinate, radius_km: f64, payload: Value) {
            self.calls.lock().push((coordinate, radius_km, payload));
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        push: Arc<RecordingPush>,
        service: AlertService,
    }

    fn fixture(fanout: FanoutSettings) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(FanoutRouter::new(registry.clone(), 10, None));
        let push = Arc::new(RecordingPush::default());
        let store = Arc::new(IncidentRepo::new(Database::in_memory().unwrap()));
        let service = AlertService::new(store, router, push.clone(), fanout, None);
        Fixture {
            registry,
            push,
            service,
        }
    }

    fn connect(
        f: &Fixture,
        role: Role,
        at: Option<(f64, f64)>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<str>>) {
        let (handle, rx) = ConnectionHandle::channel(8);
        f.registry.add(handle.clone());
        f.registry.set_presence(
            handle.id(),
            role,
            at.map(|(lat, lng)| Coordinate::new(lat, lng).unwrap()),
            None,
        );
        (handle, rx)
    }

    fn sf_incident() -> NewIncident {
        NewIncident {
            lat: 37.7749,
            lng: -122.4194,
            category: "fire".into(),
            note: "kitchen fire".into(),
            contact: None,
        }
    }

    fn recv(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn report_alerts_nearby_and_responders() {
        let f = fixture(FanoutSettings::default());
        let (_near, mut near_rx) = connect(&f, Role::Community, Some((37.77652, -122.4194)));
        let (_far, mut far_rx) = connect(&f, Role::Community, Some((37.9, -122.4194)));
        let (_medic, mut medic_rx) = connect(&f, Role::Responder, None);

        let report = f.service.report(&sf_incident(), None).unwrap();
        assert_eq!(report.radius_km, 0.2);
        assert_eq!(report.nearby, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.responders_notified, 1);

        let near = recv(&mut near_rx);
        assert_eq!(near["type"], "incident-new");
        assert!(near["distanceKm"].as_f64().unwrap() <= 0.2);
        assert!(far_rx.try_recv().is_err());

        let medic = recv(&mut medic_rx);
        assert_eq!(medic["type"], "incident-new");
        assert!(medic.get("distanceKm").is_none());
        assert_eq!(medic["event"]["id"], report.incident.id.as_str());

        let calls = f.push.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 0.2);
        assert_eq!(calls[0].2["category"], "fire");
    }

    #[test]
    fn report_radius_override() {
        let f = fixture(FanoutSettings::default());
        let (_far, mut far_rx) = connect(&f, Role::Community, Some((37.7849, -122.4194)));

        let report = f.service.report(&sf_incident(), Some(5.0)).unwrap();
        assert_eq!(report.radius_km, 5.0);
        assert_eq!(report.delivered, 1);
        assert!(far_rx.try_recv().is_ok());

        // Nonsense overrides fall back to the configured radius.
        let report = f.service.report(&sf_incident(), Some(-1.0)).unwrap();
        assert_eq!(report.radius_km, 0.2);
        assert_eq!(report.nearby, 0);
    }

    #[test]
    fn responders_and_push_can_be_disabled() {
        let f = fixture(FanoutSettings {
            notify_responders: false,
            push_enabled: false,
            ..FanoutSettings::default()
        });
        let (_medic, mut medic_rx) = connect(&f, Role::Responder, None);

        let report = f.service.report(&sf_incident(), None).unwrap();
        assert_eq!(report.responders_notified, 0);
        assert!(medic_rx.try_recv().is_err());
        assert!(f.push.calls.lock().is_empty());
    }

    #[test]
    fn invalid_incident_is_not_fanned_out() {
        let f = fixture(FanoutSettings::default());
        let (_medic, mut medic_rx) = connect(&f, Role::Responder, None);
        let mut input = sf_incident();
        input.lat = 123.0;

        let err = f.service.report(&input, None).unwrap_err();
        assert!(matches!(err, ServerError::Store(StoreError::InvalidInput(_))));
        assert!(medic_rx.try_recv().is_err());
        assert!(f.push.calls.lock().is_empty());
    }

    #[test]
    fn update_broadcasts_to_everyone() {
        let f = fixture(FanoutSettings::default());
        let created = f.service.report(&sf_incident(), None).unwrap().incident;
        let (_a, mut a_rx) = connect(&f, Role::Community, None);
        let (_b, mut b_rx) = connect(&f, Role::Responder, None);

        let updated = f
            .service
            .update(
                &created.id,
                &IncidentPatch {
                    status: Some(IncidentStatus::Resolved),
                    note: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::Resolved);

        for rx in [&mut a_rx, &mut b_rx] {
            let msg = recv(rx);
            assert_eq!(msg["type"], "incident-updated");
            assert_eq!(msg["event"]["status"], "resolved");
        }
        assert!(f.service.active().unwrap().is_empty());
    }

    #[test]
    fn update_missing_is_none_and_silent() {
        let f = fixture(FanoutSettings::default());
        let (_a, mut a_rx) = connect(&f, Role::Community, None);
        let patch = IncidentPatch {
            status: Some(IncidentStatus::InProgress),
            note: None,
        };
        assert!(f.service.update(&IncidentId::new(), &patch).unwrap().is_none());
        assert!(a_rx.try_recv().is_err());
    }
}
