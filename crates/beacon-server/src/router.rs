//! Proximity fan-out.
//!
//! Every pass snapshots the registry, enqueues on each selected handle, and
//! prunes entries whose write failed only after the pass completes. A dead
//! or slow recipient never stops delivery to the rest.

use std::sync::Arc;
use std::time::Instant;

use beacon_core::geo::{bounding_box, distance_km};
use beacon_core::ids::ConnectionId;
use beacon_core::incident::IncidentEvent;
use beacon_core::protocol::OutboundEvent;
use beacon_core::roles::Role;
use beacon_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, SendOutcome};
use crate::metrics::{FANOUT_DURATION_SECONDS, FANOUT_PRUNED_TOTAL, FANOUT_RECIPIENTS_TOTAL};
use crate::registry::ConnectionRegistry;

/// Outcome of one fan-out pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    /// Entries removed from the registry because their write failed.
    pub pruned: usize,
}

pub struct FanoutRouter {
    registry: Arc<ConnectionRegistry>,
    max_send_drops: u64,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl FanoutRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        max_send_drops: u64,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            registry,
            max_send_drops: max_send_drops.max(1),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Community connections within `radius_km` of the incident, boundary
    /// inclusive, with their distance. Order is unspecified.
    pub fn route(&self, event: &IncidentEvent, radius_km: f64) -> Vec<(ConnectionId, f64)> {
        self.nearby(event, radius_km)
            .into_iter()
            .map(|(handle, d)| (handle.id().clone(), d))
            .collect()
    }

    fn nearby(&self, event: &IncidentEvent, radius_km: f64) -> Vec<(Arc<ConnectionHandle>, f64)> {
        let origin = event.coordinate;
        let bbox = bounding_box(origin, radius_km);
        self.registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.role == Some(Role::Community))
            .filter_map(|entry| {
                let at = entry.coordinate?;
                if !bbox.contains(at) {
                    return None;
                }
                let d = distance_km(origin, at);
                (d <= radius_km).then_some((entry.handle, d))
            })
            .collect()
    }

    /// Send `incident-new` with each recipient's own distance.
    pub fn fan_out_incident(&self, event: &IncidentEvent, radius_km: f64) -> DeliveryReport {
        let started = Instant::now();
        let targets = self.nearby(event, radius_km);
        let mut report = DeliveryReport {
            recipients: targets.len(),
            ..Default::default()
        };
        let mut failed = Vec::new();

        for (handle, d) in targets {
            let outcome = handle.send_event(&OutboundEvent::IncidentNew {
                event: event.clone(),
                distance_km: Some(d),
            });
            self.account(&handle, outcome, &mut report, &mut failed);
        }

        self.finish("nearby", started, &mut report, failed);
        debug!(
            incident_id = %event.id,
            radius_km,
            recipients = report.recipients,
            delivered = report.delivered,
            pruned = report.pruned,
            "incident fan-out"
        );
        report
    }

    /// Deliver to every live connection.
    pub fn broadcast_all(&self, event: &OutboundEvent) -> DeliveryReport {
        self.deliver("all", event, |_| true)
    }

    /// Deliver to connections whose current role is `role`.
    pub fn notify_role(&self, role: Role, event: &OutboundEvent) -> DeliveryReport {
        self.deliver(role.as_str(), event, |r| r == Some(role))
    }

    fn deliver(
        &self,
        scope: &'static str,
        event: &OutboundEvent,
        filter: impl Fn(Option<Role>) -> bool,
    ) -> DeliveryReport {
        let started = Instant::now();
        let mut report = DeliveryReport::default();
        let json: Arc<str> = match event.encode() {
            Ok(j) => Arc::from(j),
            Err(e) => {
                warn!(scope, error = %e, "failed to serialize event");
                return report;
            }
        };

        let mut failed = Vec::new();
        for entry in self.registry.snapshot() {
            if !filter(entry.role) {
                continue;
            }
            report.recipients += 1;
            let outcome = entry.handle.send(json.clone());
            self.account(&entry.handle, outcome, &mut report, &mut failed);
        }

        self.finish(scope, started, &mut report, failed);
        debug!(
            scope,
            recipients = report.recipients,
            delivered = report.delivered,
            pruned = report.pruned,
            "broadcast event"
        );
        report
    }

    fn account(
        &self,
        handle: &Arc<ConnectionHandle>,
        outcome: SendOutcome,
        report: &mut DeliveryReport,
        failed: &mut Vec<Arc<ConnectionHandle>>,
    ) {
        match outcome {
            SendOutcome::Sent => report.delivered += 1,
            SendOutcome::Closed => {
                debug!(connection_id = %handle.id(), "recipient transport closed");
                failed.push(handle.clone());
            }
            SendOutcome::Full => {
                let drops = handle.drop_count();
                if drops >= self.max_send_drops {
                    warn!(connection_id = %handle.id(), drops, "pruning slow connection");
                    failed.push(handle.clone());
                } else {
                    warn!(connection_id = %handle.id(), total_drops = drops, "outbox full, message dropped");
                }
            }
        }
    }

    /// Prune after iteration so the snapshot pass never contends with removal.
    fn finish(
        &self,
        scope: &'static str,
        started: Instant,
        report: &mut DeliveryReport,
        failed: Vec<Arc<ConnectionHandle>>,
    ) {
        for handle in failed {
            if self.registry.remove(handle.id()).is_some() {
                report.pruned += 1;
            }
            handle.request_eviction();
        }

        if let Some(m) = &self.metrics {
            let labels = [("scope", scope)];
            m.counter_inc(FANOUT_RECIPIENTS_TOTAL, &labels, report.recipients as u64);
            if report.pruned > 0 {
                m.counter_inc(FANOUT_PRUNED_TOTAL, &labels, report.pruned as u64);
            }
            m.histogram_observe(FANOUT_DURATION_SECONDS, &labels, started.elapsed().as_secs_f64());
        }
    }
}
