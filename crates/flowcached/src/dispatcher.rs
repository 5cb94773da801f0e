//! Event dispatcher and flow-cache manager.
//!
//! The single consumer of the merge queue. Packet-ins run the install
//! protocol (decide, emit, install, record); idle timeouts run the evict
//! protocol (look up, delete, forget). All cache mutations happen here.

use crate::channel::{IdleTimeoutNotification, RawPacketIn};
use crate::codec::{decode_packet_in, encode_packet_out};
use crate::config::ControllerConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{ControllerError, Result};
use crate::flow_cache::{FlowAction, FlowCache, FlowCacheEntry, FlowKey};
use crate::metrics::MetricsCollector;
use crate::notification::{Notification, NotificationPayload, NotificationReceiver};
use crate::packet::parse_ipv4_flow;
use crate::schema::{PipelineSchema, PUNT_REASON_FIELD};
use crate::switch::SwitchConnection;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What handling one notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A rule was installed; `replaced` if the key was already cached.
    Installed { key: FlowKey, replaced: bool },
    /// The packet-in needed no action.
    Ignored,
    /// Rules from an idle-timeout notification were processed.
    Evicted { removed: usize, unknown: usize },
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub packet_ins: u64,
    pub idle_timeouts: u64,
    pub installs: u64,
    pub replaced: u64,
    pub ignored: u64,
    pub evictions: u64,
    pub unknown_evictions: u64,
    pub dropped: u64,
}

impl From<&MetricsCollector> for DispatchStats {
    fn from(metrics: &MetricsCollector) -> Self {
        Self {
            packet_ins: metrics.packet_ins_total.get() as u64,
            idle_timeouts: metrics.idle_timeouts_total.get() as u64,
            installs: metrics.flows_installed_total.get() as u64,
            replaced: metrics.flows_replaced_total.get() as u64,
            ignored: metrics.packet_ins_ignored_total.get() as u64,
            evictions: metrics.flows_evicted_total.get() as u64,
            unknown_evictions: metrics.unknown_evictions_total.get() as u64,
            dropped: metrics.notifications_dropped_total.get() as u64,
        }
    }
}

/// Owns the flow cache and applies notifications to it one at a time.
pub struct Dispatcher {
    config: Arc<ControllerConfig>,
    schema: Arc<PipelineSchema>,
    cache: FlowCache,
    diagnostics: Option<Diagnostics>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ControllerConfig>,
        schema: Arc<PipelineSchema>,
        metrics: MetricsCollector,
    ) -> Self {
        let diagnostics = config
            .diagnostics
            .enabled
            .then(|| Diagnostics::new(&config.pipeline));
        Self {
            config,
            schema,
            cache: FlowCache::new(),
            diagnostics,
            metrics,
        }
    }

    pub fn cache(&self) -> &FlowCache {
        &self.cache
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats::from(&self.metrics)
    }

    /// Consumes notifications until shutdown, the queue closing, or a fatal
    /// error.
    pub async fn run(
        mut self,
        mut queue: NotificationReceiver,
        shutdown: CancellationToken,
    ) -> Result<DispatchStats> {
        info!("dispatcher started");
        loop {
            let notification = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = queue.pop() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };

            let switch = notification.switch().name().to_string();
            let kind = notification.kind();
            match self.handle(notification).await {
                Ok(_) => {}
                Err(ControllerError::Shutdown) => break,
                Err(e) if e.is_notification_local() => {
                    self.metrics.notifications_dropped_total.inc();
                    warn!(%switch, %kind, error = %e, "dropping notification");
                }
                Err(e) => {
                    error!(%switch, %kind, error = %e, "dispatcher stopping on fatal error");
                    return Err(e);
                }
            }
        }
        let stats = self.stats();
        info!(cached = self.cache.len(), ?stats, "dispatcher stopped");
        Ok(stats)
    }

    /// Handles one notification.
    pub async fn handle(&mut self, notification: Notification) -> Result<DispatchOutcome> {
        let latency = notification.received_at().elapsed();
        let (switch, payload) = notification.into_parts();
        debug!(switch = %switch.name(), ?latency, "dispatching notification");
        self.metrics.observe_queue_latency(latency);
        let outcome = match payload {
            NotificationPayload::PacketIn(packet) => {
                self.metrics.packet_ins_total.inc();
                self.install(&switch, packet).await
            }
            NotificationPayload::IdleTimeout(idle) => {
                self.metrics.idle_timeouts_total.inc();
                self.evict(&switch, idle).await
            }
        };
        self.metrics.set_cached_flows(self.cache.len());
        outcome
    }

    #[instrument(skip_all, fields(switch = %switch.name()))]
    async fn install(
        &mut self,
        switch: &Arc<SwitchConnection>,
        packet: RawPacketIn,
    ) -> Result<DispatchOutcome> {
        if packet.payload.is_empty() {
            debug!("ignoring packet-in with empty payload");
            self.metrics.packet_ins_ignored_total.inc();
            return Ok(DispatchOutcome::Ignored);
        }

        let metadata = decode_packet_in(&packet.metadata, self.schema.packet_in())?;
        let reason = metadata.require(PUNT_REASON_FIELD)?;
        if reason != self.schema.flow_unknown() {
            debug!(
                reason = self.schema.punt_reason_name(reason),
                "ignoring packet-in"
            );
            self.metrics.packet_ins_ignored_total.inc();
            return Ok(DispatchOutcome::Ignored);
        }

        let flow = parse_ipv4_flow(&packet.payload)?;
        let port = self.config.route(switch.name(), flow.dst)?;
        let dst_mac = self.config.address(flow.dst)?;
        let opcode = self.schema.send_to_port_opcode();
        let packet_out = encode_packet_out(opcode, 0, port.as_u64())?;

        let key = FlowKey {
            switch: switch.name().to_string(),
            protocol: flow.protocol,
            src: flow.src,
            dst: flow.dst,
        };
        let action = FlowAction {
            port,
            decrement_ttl: self.config.flow.decrement_ttl,
            new_dscp: self.config.flow.new_dscp,
            dst_mac,
        };
        info!(flow = %key, %port, %dst_mac, "unknown flow");

        // Emission and installation are independent; a failed emit does not
        // prevent the install attempt.
        debug!(opcode = self.schema.opcode_name(opcode), %port, "emitting packet-out");
        let emitted = switch.emit_packet(packet.payload.clone(), packet_out).await;
        if let Err(ControllerError::Shutdown) = emitted {
            return Err(ControllerError::Shutdown);
        }

        let idle_timeout = self.config.idle_timeout();
        let entry = action.table_entry(&key, &self.config.pipeline, idle_timeout);
        let rule = match switch.write_rule(entry).await {
            Ok(rule) => rule,
            Err(e) => {
                if let Err(emit_error) = &emitted {
                    warn!(error = %emit_error, "packet-out also failed");
                }
                return Err(e);
            }
        };

        let previous = self.cache.insert(FlowCacheEntry {
            key: key.clone(),
            action,
            idle_timeout,
            rule: rule.clone(),
            installed_at: Instant::now(),
        });
        let replaced = previous.is_some();
        if replaced {
            warn!(flow = %key, "flow was already cached, entry overwritten");
        }
        self.metrics.record_install(replaced);
        info!(flow = %key, rule = %rule, "flow rule installed");

        emitted?;

        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.report(switch, &flow).await;
        }
        Ok(DispatchOutcome::Installed { key, replaced })
    }

    #[instrument(skip_all, fields(switch = %switch.name(), rules = idle.rules.len()))]
    async fn evict(
        &mut self,
        switch: &Arc<SwitchConnection>,
        idle: IdleTimeoutNotification,
    ) -> Result<DispatchOutcome> {
        let mut removed = 0;
        let mut unknown = 0;
        for rule in &idle.rules {
            if self.cache.find_by_rule(switch.name(), rule).is_none() {
                debug!(rule = %rule, "idle timeout for unknown rule");
                unknown += 1;
                self.metrics.unknown_evictions_total.inc();
                continue;
            }

            switch.delete_rule(rule).await?;
            if let Some(entry) = self.cache.remove_by_rule(switch.name(), rule) {
                info!(
                    flow = %entry.key,
                    lifetime = ?entry.installed_at.elapsed(),
                    "flow rule evicted"
                );
            }
            removed += 1;
            self.metrics.flows_evicted_total.inc();
        }
        Ok(DispatchOutcome::Evicted { removed, unknown })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::{SimCall, SimOp, SimulatedSwitch};
    use crate::channel::{CounterData, ForwardingPipeline, PacketMetadata, StatusCode, SwitchChannel};
    use crate::codec::encode_packet_in;
    use crate::config::SwitchConfig;
    use crate::packet::{build_ipv4_frame, Ipv4Flow};
    use crate::recovery::RetryPolicy;
    use bytes::Bytes;
    use fabric_types::{DeviceId, PortNumber};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig {
            switches: vec![SwitchConfig {
                name: "s1".into(),
                address: "127.0.0.1:50051".into(),
                device_id: DeviceId(0),
            }],
            ..Default::default()
        };
        config.routes.insert(
            "s1".into(),
            BTreeMap::from([(Ipv4Addr::new(10, 0, 1, 1), PortNumber(1))]),
        );
        config.addresses.insert(
            Ipv4Addr::new(10, 0, 1, 1),
            "08:00:00:00:01:11".parse().unwrap(),
        );
        config
    }

    fn setup() -> (Dispatcher, Arc<SimulatedSwitch>, Arc<SwitchConnection>) {
        setup_with(config())
    }

    fn setup_with(config: ControllerConfig) -> (Dispatcher, Arc<SimulatedSwitch>, Arc<SwitchConnection>) {
        let sim = Arc::new(SimulatedSwitch::new(config.switches[0].identity(), false));
        sim.arbitrate(1).unwrap();
        sim.set_forwarding_pipeline(&ForwardingPipeline::default())
            .unwrap();
        let conn = Arc::new(SwitchConnection::new(
            sim.clone(),
            RetryPolicy::new(Duration::from_millis(1), CancellationToken::new()),
        ));
        let schema = Arc::new(PipelineSchema::from_config(&config.pipeline).unwrap());
        let metrics = MetricsCollector::new().unwrap();
        (Dispatcher::new(Arc::new(config), schema, metrics), sim, conn)
    }

    fn punt(dst: Ipv4Addr, reason: u64) -> RawPacketIn {
        let schema = PipelineSchema::from_config(&Default::default()).unwrap();
        let flow = Ipv4Flow {
            protocol: 17,
            src: Ipv4Addr::new(10, 0, 2, 2),
            dst,
        };
        let mac = "08:00:00:00:02:22".parse().unwrap();
        RawPacketIn {
            payload: build_ipv4_frame(mac, mac, &flow, b"x").into(),
            metadata: encode_packet_in(schema.packet_in(), &[(2, reason)]).unwrap(),
        }
    }

    fn notification(conn: &Arc<SwitchConnection>, packet: RawPacketIn) -> Notification {
        Notification::new(Arc::clone(conn), NotificationPayload::PacketIn(packet))
    }

    #[tokio::test]
    async fn test_empty_payload_is_ignored() {
        let (mut dispatcher, sim, conn) = setup();
        let packet = RawPacketIn {
            payload: Bytes::new(),
            metadata: vec![],
        };
        let outcome = dispatcher.handle(notification(&conn, packet)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert!(sim.installed_rules().is_empty());
    }

    #[tokio::test]
    async fn test_other_punt_reason_is_ignored() {
        let (mut dispatcher, sim, conn) = setup();
        let packet = punt(Ipv4Addr::new(10, 0, 1, 1), 2);
        let outcome = dispatcher.handle(notification(&conn, packet)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(dispatcher.stats().ignored, 1);
        assert_eq!(sim.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_route_is_notification_local() {
        let (mut dispatcher, sim, conn) = setup();
        let packet = punt(Ipv4Addr::new(10, 0, 9, 9), 1);
        let err = dispatcher
            .handle(notification(&conn, packet))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingRoute { .. }));
        assert!(err.is_notification_local());
        assert!(sim.installed_rules().is_empty());
        assert!(dispatcher.cache().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_metadata_id_is_rejected() {
        let (mut dispatcher, _sim, conn) = setup();
        let mut packet = punt(Ipv4Addr::new(10, 0, 1, 1), 1);
        packet.metadata.push(PacketMetadata {
            metadata_id: 42,
            value: Bytes::from_static(&[0]),
        });
        let err = dispatcher
            .handle(notification(&conn, packet))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::SchemaMismatch { id: 42 }));
    }

    #[tokio::test]
    async fn test_emit_failure_does_not_block_install() {
        let (mut dispatcher, sim, conn) = setup();
        sim.fail_next(SimOp::PacketOut, StatusCode::Unimplemented, 1);
        let packet = punt(Ipv4Addr::new(10, 0, 1, 1), 1);
        let err = dispatcher
            .handle(notification(&conn, packet))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Channel {
                operation: "emit_packet",
                ..
            }
        ));
        assert_eq!(sim.installed_rules().len(), 1);
        assert_eq!(dispatcher.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_notification_is_counted() {
        let (dispatcher, _sim, conn) = setup();
        let packet = punt(Ipv4Addr::new(10, 0, 9, 9), 1);
        let (tx, rx) = crate::notification::merge_queue();
        tx.push(notification(&conn, packet)).unwrap();
        drop(tx);

        let stats = dispatcher.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(stats.packet_ins, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.installs, 0);
    }

    #[tokio::test]
    async fn test_diagnostics_run_after_install() {
        let mut config = config();
        config.diagnostics.enabled = true;
        let ingress = config.pipeline.ingress_counter.clone();
        let egress = config.pipeline.egress_counter.clone();
        let (mut dispatcher, sim, conn) = setup_with(config);
        sim.set_counter(
            &ingress,
            1,
            CounterData {
                packet_count: 1,
                byte_count: 60,
            },
        );

        let packet = punt(Ipv4Addr::new(10, 0, 1, 1), 1);
        let outcome = dispatcher.handle(notification(&conn, packet)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Installed { replaced: false, .. }));

        let reads: Vec<SimCall> = sim
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SimCall::ReadCounters { .. }))
            .collect();
        assert_eq!(
            reads,
            vec![
                SimCall::ReadCounters {
                    counter: ingress,
                    index: Some(1),
                },
                SimCall::ReadCounters {
                    counter: egress,
                    index: Some(1),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_diagnostics_failure_does_not_fail_install() {
        let mut config = config();
        config.diagnostics.enabled = true;
        let (mut dispatcher, sim, conn) = setup_with(config);
        sim.fail_next(SimOp::ReadCounters, StatusCode::PermissionDenied, 2);
        sim.fail_next(SimOp::ReadTableEntries, StatusCode::Unavailable, 1);

        let packet = punt(Ipv4Addr::new(10, 0, 1, 1), 1);
        let outcome = dispatcher.handle(notification(&conn, packet)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Installed { .. }));
        assert_eq!(sim.installed_rules().len(), 1);
        assert_eq!(dispatcher.stats().installs, 1);
    }
}
