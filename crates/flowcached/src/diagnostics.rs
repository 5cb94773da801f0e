//! Post-install diagnostics: punt-path counters and a flow table dump.
//!
//! Results are only logged. A failed read never affects flow handling.

use crate::channel::CounterEntry;
use crate::config::PipelineConfig;
use crate::packet::Ipv4Flow;
use crate::switch::SwitchConnection;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Diagnostics {
    ingress_counter: String,
    egress_counter: String,
}

impl Diagnostics {
    pub fn new(pipeline: &PipelineConfig) -> Self {
        Self {
            ingress_counter: pipeline.ingress_counter.clone(),
            egress_counter: pipeline.egress_counter.clone(),
        }
    }

    /// Counters are indexed by the last octet of the destination address.
    pub fn counter_index(flow: &Ipv4Flow) -> u64 {
        u64::from(flow.dst.octets()[3])
    }

    /// Logs the punt-path counters for `flow` and the switch's table
    /// entries. Returns the counter cells that could be read.
    pub async fn report(&self, switch: &SwitchConnection, flow: &Ipv4Flow) -> Vec<CounterEntry> {
        let index = Self::counter_index(flow);
        let mut read = Vec::new();
        for counter in [&self.ingress_counter, &self.egress_counter] {
            match switch.read_counters(counter, Some(index)).await {
                Ok(cells) => {
                    for cell in &cells {
                        info!(
                            switch = %switch.name(),
                            counter = %cell.counter,
                            index = cell.index,
                            packets = cell.data.packet_count,
                            bytes = cell.data.byte_count,
                            "counter"
                        );
                    }
                    read.extend(cells);
                }
                Err(e) => warn!(switch = %switch.name(), %counter, error = %e, "counter read failed"),
            }
        }

        match switch.read_table_entries().await {
            Ok(entries) => {
                info!(switch = %switch.name(), count = entries.len(), "installed table entries");
                for entry in entries {
                    debug!(
                        switch = %switch.name(),
                        table = %entry.table,
                        rule = %entry.rule_handle(),
                        action = %entry.action,
                        idle_timeout_ns = entry.idle_timeout_ns,
                        "table entry"
                    );
                }
            }
            Err(e) => warn!(switch = %switch.name(), error = %e, "table dump failed"),
        }
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::{SimOp, SimulatedSwitch};
    use crate::channel::{CounterData, ForwardingPipeline, StatusCode, SwitchChannel, SwitchIdentity};
    use crate::recovery::RetryPolicy;
    use fabric_types::DeviceId;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn flow() -> Ipv4Flow {
        Ipv4Flow {
            protocol: 17,
            src: Ipv4Addr::new(10, 0, 2, 2),
            dst: Ipv4Addr::new(10, 0, 1, 7),
        }
    }

    fn switch() -> (Arc<SimulatedSwitch>, SwitchConnection) {
        let sim = Arc::new(SimulatedSwitch::new(
            SwitchIdentity {
                name: "s1".into(),
                address: "127.0.0.1:50051".into(),
                device_id: DeviceId(0),
            },
            false,
        ));
        sim.arbitrate(1).unwrap();
        sim.set_forwarding_pipeline(&ForwardingPipeline::default())
            .unwrap();
        let conn = SwitchConnection::new(
            sim.clone(),
            RetryPolicy::new(Duration::from_millis(1), CancellationToken::new()),
        );
        (sim, conn)
    }

    #[test]
    fn test_counter_index_is_last_octet() {
        let flow = Ipv4Flow {
            protocol: 6,
            src: Ipv4Addr::new(10, 0, 1, 1),
            dst: Ipv4Addr::new(10, 0, 3, 3),
        };
        assert_eq!(Diagnostics::counter_index(&flow), 3);
    }

    #[tokio::test]
    async fn test_report_reads_counters_at_last_octet() {
        let (sim, conn) = switch();
        let pipeline = PipelineConfig::default();
        let data = CounterData {
            packet_count: 4,
            byte_count: 400,
        };
        sim.set_counter(&pipeline.ingress_counter, 7, data);
        sim.set_counter(&pipeline.ingress_counter, 8, CounterData::default());

        let cells = Diagnostics::new(&pipeline).report(&conn, &flow()).await;
        assert_eq!(
            cells,
            vec![
                CounterEntry {
                    counter: pipeline.ingress_counter.clone(),
                    index: 7,
                    data,
                },
                CounterEntry {
                    counter: pipeline.egress_counter.clone(),
                    index: 7,
                    data: CounterData::default(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_report_tolerates_failed_reads() {
        let (sim, conn) = switch();
        let pipeline = PipelineConfig::default();
        sim.fail_next(SimOp::ReadCounters, StatusCode::Unavailable, 1);
        sim.fail_next(SimOp::ReadTableEntries, StatusCode::Internal, 1);

        let cells = Diagnostics::new(&pipeline).report(&conn, &flow()).await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].counter, pipeline.egress_counter);
    }
}
