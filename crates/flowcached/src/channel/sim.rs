//! In-memory simulated switch.
//!
//! [`SimulatedSwitch`] implements the full [`SwitchChannel`] contract over
//! local state: installed table entries, clone sessions, counters and the
//! two inbound event queues. It backs the daemon's simulated fabric and every
//! test in this crate. Faults can be scripted per operation and every call
//! attempt is recorded for inspection.

use super::{
    BitField, ChannelConnector, ChannelError, ChannelResult, CloneSessionEntry, CounterData,
    CounterEntry, ForwardingPipeline, IdleTimeoutNotification, RawPacketIn, RuleHandle,
    StatusCode, SwitchChannel, SwitchIdentity, TableEntry,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// How often a blocked idle-timeout call re-checks rule expiry.
const EXPIRY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Channel operations that can carry a scripted fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Arbitrate,
    SetPipeline,
    WriteTableEntry,
    DeleteTableEntry,
    WriteCloneSession,
    ReadCounters,
    ReadTableEntries,
    PacketIn,
    IdleTimeout,
    PacketOut,
}

/// A recorded call attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Arbitrate(u64),
    SetPipeline,
    WriteTableEntry(TableEntry),
    DeleteTableEntry(RuleHandle),
    WriteCloneSession(CloneSessionEntry),
    ReadCounters { counter: String, index: Option<u64> },
    PacketOut { payload: Bytes, metadata: Vec<BitField> },
}

#[derive(Debug)]
struct InstalledRule {
    entry: TableEntry,
    last_hit: Instant,
    reported: bool,
}

impl InstalledRule {
    fn is_expired(&self, now: Instant) -> bool {
        self.entry.idle_timeout_ns > 0
            && !self.reported
            && now.duration_since(self.last_hit) >= Duration::from_nanos(self.entry.idle_timeout_ns)
    }
}

#[derive(Debug, Default)]
struct SimState {
    closed: bool,
    primary: bool,
    pipeline: Option<ForwardingPipeline>,
    tables: HashMap<RuleHandle, InstalledRule>,
    clone_sessions: HashMap<u32, CloneSessionEntry>,
    counters: HashMap<(String, u64), CounterData>,
    packet_ins: VecDeque<RawPacketIn>,
    idle_notifications: VecDeque<IdleTimeoutNotification>,
    faults: HashMap<SimOp, VecDeque<ChannelError>>,
    calls: Vec<SimCall>,
}

impl SimState {
    fn take_fault(&mut self, op: SimOp) -> ChannelResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> ChannelResult<()> {
        if self.closed {
            Err(ChannelError::closed())
        } else {
            Ok(())
        }
    }

    fn check_primary(&self) -> ChannelResult<()> {
        if self.primary {
            Ok(())
        } else {
            Err(ChannelError::new(
                StatusCode::PermissionDenied,
                "controller is not primary for this device",
            ))
        }
    }

    fn collect_expired(&mut self, now: Instant) -> Vec<RuleHandle> {
        let mut expired = Vec::new();
        for (handle, rule) in self.tables.iter_mut() {
            if rule.is_expired(now) {
                rule.reported = true;
                expired.push(handle.clone());
            }
        }
        expired.sort();
        expired
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// One simulated switch and its control session.
#[derive(Debug)]
pub struct SimulatedSwitch {
    identity: SwitchIdentity,
    idle_expiry: bool,
    state: Mutex<SimState>,
    wakeup: Condvar,
}

impl SimulatedSwitch {
    /// Creates a switch. With `idle_expiry` enabled, rules whose idle budget
    /// runs out after their last write are reported automatically.
    pub fn new(identity: SwitchIdentity, idle_expiry: bool) -> Self {
        Self {
            identity,
            idle_expiry,
            state: Mutex::new(SimState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Queues a punted packet for the packet-in listener.
    pub fn inject_packet_in(&self, packet: RawPacketIn) {
        self.state.lock().packet_ins.push_back(packet);
        self.wakeup.notify_all();
    }

    /// Queues an idle-timeout notification for the given rules.
    pub fn inject_idle_timeout(&self, rules: Vec<RuleHandle>) {
        self.state
            .lock()
            .idle_notifications
            .push_back(IdleTimeoutNotification {
                rules,
                timestamp_ns: now_ns(),
            });
        self.wakeup.notify_all();
    }

    /// Makes the next `times` calls of `op` fail with `code`.
    pub fn fail_next(&self, op: SimOp, code: StatusCode, times: usize) {
        {
            let mut state = self.state.lock();
            let queue = state.faults.entry(op).or_default();
            for _ in 0..times {
                queue.push_back(ChannelError::new(code, format!("injected {:?} fault", op)));
            }
        }
        self.wakeup.notify_all();
    }

    pub fn set_counter(&self, counter: &str, index: u64, data: CounterData) {
        self.state
            .lock()
            .counters
            .insert((counter.to_string(), index), data);
    }

    /// Every call attempt so far, including failed ones.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Currently installed table entries, sorted by rule handle.
    pub fn installed_rules(&self) -> Vec<TableEntry> {
        let state = self.state.lock();
        let mut rules: Vec<(&RuleHandle, &InstalledRule)> = state.tables.iter().collect();
        rules.sort_by(|a, b| a.0.cmp(b.0));
        rules.into_iter().map(|(_, r)| r.entry.clone()).collect()
    }

    pub fn clone_session(&self, session_id: u32) -> Option<CloneSessionEntry> {
        self.state.lock().clone_sessions.get(&session_id).cloned()
    }

    pub fn has_pipeline(&self) -> bool {
        self.state.lock().pipeline.is_some()
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().primary
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.primary = false;
    }
}

impl SwitchChannel for SimulatedSwitch {
    fn identity(&self) -> &SwitchIdentity {
        &self.identity
    }

    fn arbitrate(&self, election_id: u64) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Arbitrate(election_id));
        state.check_open()?;
        state.take_fault(SimOp::Arbitrate)?;
        state.primary = true;
        Ok(())
    }

    fn set_forwarding_pipeline(&self, pipeline: &ForwardingPipeline) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::SetPipeline);
        state.check_open()?;
        state.take_fault(SimOp::SetPipeline)?;
        state.check_primary()?;
        state.pipeline = Some(pipeline.clone());
        state.tables.clear();
        Ok(())
    }

    fn write_table_entry(&self, entry: &TableEntry) -> ChannelResult<RuleHandle> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::WriteTableEntry(entry.clone()));
        state.check_open()?;
        state.take_fault(SimOp::WriteTableEntry)?;
        state.check_primary()?;
        if state.pipeline.is_none() {
            return Err(ChannelError::new(
                StatusCode::FailedPrecondition,
                "no forwarding pipeline installed",
            ));
        }

        // Writes to an existing match key replace the entry.
        let handle = entry.rule_handle();
        state.tables.insert(
            handle.clone(),
            InstalledRule {
                entry: entry.clone(),
                last_hit: Instant::now(),
                reported: false,
            },
        );
        debug!(switch = %self.identity.name, rule = %handle, "sim: installed rule");
        Ok(handle)
    }

    fn delete_table_entry(&self, rule: &RuleHandle) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DeleteTableEntry(rule.clone()));
        state.check_open()?;
        state.take_fault(SimOp::DeleteTableEntry)?;
        state.check_primary()?;
        match state.tables.remove(rule) {
            Some(_) => Ok(()),
            None => Err(ChannelError::new(
                StatusCode::NotFound,
                format!("no entry for {}", rule),
            )),
        }
    }

    fn write_clone_session(&self, session: &CloneSessionEntry) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::WriteCloneSession(session.clone()));
        state.check_open()?;
        state.take_fault(SimOp::WriteCloneSession)?;
        state.check_primary()?;
        if state.clone_sessions.contains_key(&session.session_id) {
            return Err(ChannelError::new(
                StatusCode::AlreadyExists,
                format!("clone session {} exists", session.session_id),
            ));
        }
        state.clone_sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    fn read_counters(&self, counter: &str, index: Option<u64>) -> ChannelResult<Vec<CounterEntry>> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::ReadCounters {
            counter: counter.to_string(),
            index,
        });
        state.check_open()?;
        state.take_fault(SimOp::ReadCounters)?;
        let mut cells: Vec<CounterEntry> = match index {
            Some(index) => {
                let data = state
                    .counters
                    .get(&(counter.to_string(), index))
                    .copied()
                    .unwrap_or_default();
                vec![CounterEntry {
                    counter: counter.to_string(),
                    index,
                    data,
                }]
            }
            None => state
                .counters
                .iter()
                .filter(|((name, _), _)| name == counter)
                .map(|((name, index), data)| CounterEntry {
                    counter: name.clone(),
                    index: *index,
                    data: *data,
                })
                .collect(),
        };
        cells.sort_by_key(|c| c.index);
        Ok(cells)
    }

    fn read_table_entries(&self) -> ChannelResult<Vec<TableEntry>> {
        {
            let mut state = self.state.lock();
            state.check_open()?;
            state.take_fault(SimOp::ReadTableEntries)?;
        }
        Ok(self.installed_rules())
    }

    fn packet_in(&self) -> ChannelResult<RawPacketIn> {
        let mut state = self.state.lock();
        loop {
            state.check_open()?;
            state.take_fault(SimOp::PacketIn)?;
            if let Some(packet) = state.packet_ins.pop_front() {
                return Ok(packet);
            }
            self.wakeup.wait(&mut state);
        }
    }

    fn idle_timeout_notification(&self) -> ChannelResult<IdleTimeoutNotification> {
        let mut state = self.state.lock();
        loop {
            state.check_open()?;
            state.take_fault(SimOp::IdleTimeout)?;
            if let Some(notification) = state.idle_notifications.pop_front() {
                return Ok(notification);
            }
            if self.idle_expiry {
                let rules = state.collect_expired(Instant::now());
                if !rules.is_empty() {
                    return Ok(IdleTimeoutNotification {
                        rules,
                        timestamp_ns: now_ns(),
                    });
                }
                self.wakeup.wait_for(&mut state, EXPIRY_POLL_INTERVAL);
            } else {
                self.wakeup.wait(&mut state);
            }
        }
    }

    fn packet_out(&self, payload: &[u8], metadata: &[BitField]) -> ChannelResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::PacketOut {
            payload: Bytes::copy_from_slice(payload),
            metadata: metadata.to_vec(),
        });
        state.check_open()?;
        state.take_fault(SimOp::PacketOut)?;
        state.check_primary()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.wakeup.notify_all();
    }
}

/// A set of simulated switches addressed by name.
///
/// Switch state survives reconnects, so a controller restart sees the clone
/// sessions and rules a previous run left behind.
#[derive(Debug, Default)]
pub struct SimulatedFabric {
    idle_expiry: bool,
    switches: Mutex<HashMap<String, Arc<SimulatedSwitch>>>,
    refused: Mutex<HashMap<String, ChannelError>>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables automatic idle-timeout reporting on every switch created later.
    pub fn with_idle_expiry(mut self, enabled: bool) -> Self {
        self.idle_expiry = enabled;
        self
    }

    /// Returns the switch with this name, if a controller connected to it.
    pub fn switch(&self, name: &str) -> Option<Arc<SimulatedSwitch>> {
        self.switches.lock().get(name).cloned()
    }

    /// Makes connection attempts to `name` fail with `error`.
    pub fn refuse_connections(&self, name: &str, error: ChannelError) {
        self.refused.lock().insert(name.to_string(), error);
    }
}

impl ChannelConnector for SimulatedFabric {
    fn connect(&self, identity: &SwitchIdentity) -> ChannelResult<Arc<dyn SwitchChannel>> {
        if let Some(err) = self.refused.lock().get(&identity.name) {
            return Err(err.clone());
        }

        let mut switches = self.switches.lock();
        let switch = switches
            .entry(identity.name.clone())
            .or_insert_with(|| Arc::new(SimulatedSwitch::new(identity.clone(), self.idle_expiry)))
            .clone();
        switch.reopen();
        debug!(switch = %identity, "sim: session opened");
        Ok(switch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BitField, FieldMatch, Replica};
    use fabric_types::{DeviceId, PortNumber};
    use pretty_assertions::assert_eq;

    fn identity() -> SwitchIdentity {
        SwitchIdentity {
            name: "s1".into(),
            address: "127.0.0.1:50051".into(),
            device_id: DeviceId(0),
        }
    }

    fn entry(dst: u64, idle_timeout_ns: u64) -> TableEntry {
        TableEntry {
            table: "MyIngress.flow_cache".into(),
            matches: vec![FieldMatch {
                field: "hdr.ipv4.dstAddr".into(),
                value: BitField::new(dst, 32),
            }],
            action: "MyIngress.cached_action".into(),
            params: vec![],
            idle_timeout_ns,
        }
    }

    fn ready_switch(idle_expiry: bool) -> SimulatedSwitch {
        let sw = SimulatedSwitch::new(identity(), idle_expiry);
        sw.arbitrate(1).unwrap();
        sw.set_forwarding_pipeline(&ForwardingPipeline::default()).unwrap();
        sw
    }

    #[test]
    fn test_writes_require_primary() {
        let sw = SimulatedSwitch::new(identity(), false);
        let err = sw.write_table_entry(&entry(1, 0)).unwrap_err();
        assert_eq!(err.code, StatusCode::PermissionDenied);
    }

    #[test]
    fn test_write_then_delete() {
        let sw = ready_switch(false);
        let handle = sw.write_table_entry(&entry(1, 0)).unwrap();
        assert_eq!(sw.installed_rules().len(), 1);
        sw.delete_table_entry(&handle).unwrap();
        assert!(sw.installed_rules().is_empty());
        assert_eq!(
            sw.delete_table_entry(&handle).unwrap_err().code,
            StatusCode::NotFound
        );
    }

    #[test]
    fn test_clone_session_already_exists() {
        let sw = ready_switch(false);
        let session = CloneSessionEntry {
            session_id: 57,
            replicas: vec![Replica {
                egress_port: PortNumber(510),
                instance: 1,
            }],
            packet_length_bytes: 0,
        };
        sw.write_clone_session(&session).unwrap();
        let err = sw.write_clone_session(&session).unwrap_err();
        assert_eq!(err.code, StatusCode::AlreadyExists);
        assert_eq!(sw.clone_session(57), Some(session));
    }

    #[test]
    fn test_scripted_fault_is_consumed() {
        let sw = ready_switch(false);
        sw.fail_next(SimOp::WriteTableEntry, StatusCode::Unavailable, 1);
        assert_eq!(
            sw.write_table_entry(&entry(1, 0)).unwrap_err().code,
            StatusCode::Unavailable
        );
        assert!(sw.write_table_entry(&entry(1, 0)).is_ok());
        assert_eq!(sw.calls().len(), 4);
    }

    #[test]
    fn test_close_wakes_blocked_packet_in() {
        let sw = Arc::new(ready_switch(false));
        let reader = {
            let sw = Arc::clone(&sw);
            std::thread::spawn(move || sw.packet_in())
        };
        std::thread::sleep(Duration::from_millis(20));
        sw.close();
        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err, ChannelError::closed());
    }

    #[test]
    fn test_idle_expiry_reports_once() {
        let sw = ready_switch(true);
        let handle = sw.write_table_entry(&entry(7, 1_000_000)).unwrap();
        let notification = sw.idle_timeout_notification().unwrap();
        assert_eq!(notification.rules, vec![handle]);

        // Reported rules are not reported again until rewritten.
        sw.inject_idle_timeout(vec![]);
        assert!(sw.idle_timeout_notification().unwrap().rules.is_empty());
    }
}
