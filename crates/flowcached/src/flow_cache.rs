//! The controller's record of flow rules installed on switches.
//!
//! Owned exclusively by the dispatcher task, so it carries no locking.
//! Entries are indexed twice: by flow key for installs, and by
//! `(switch, rule handle)` for idle-timeout evictions.

use crate::channel::{ActionParam, BitField, FieldMatch, RuleHandle, TableEntry};
use crate::config::PipelineConfig;
use fabric_types::{MacAddress, PortNumber};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

const PROTOCOL_BITWIDTH: u32 = 8;
const IPV4_ADDR_BITWIDTH: u32 = 32;
pub(crate) const PORT_BITWIDTH: u32 = 9;
const DECREMENT_TTL_BITWIDTH: u32 = 1;
const DSCP_BITWIDTH: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub switch: String,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}->{}",
            self.switch, self.protocol, self.src, self.dst
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAction {
    pub port: PortNumber,
    pub decrement_ttl: bool,
    pub new_dscp: u8,
    pub dst_mac: MacAddress,
}

impl FlowAction {
    /// Builds the flow-table entry matching `key` and applying this action.
    pub fn table_entry(&self, key: &FlowKey, pipeline: &PipelineConfig, idle_timeout: Duration) -> TableEntry {
        let field = |name: &str, value: u64, bitwidth: u32| FieldMatch {
            field: name.to_string(),
            value: BitField::new(value, bitwidth),
        };
        let param = |name: &str, value: u64, bitwidth: u32| ActionParam {
            name: name.to_string(),
            value: BitField::new(value, bitwidth),
        };

        TableEntry {
            table: pipeline.flow_table.clone(),
            matches: vec![
                field(&pipeline.match_protocol, u64::from(key.protocol), PROTOCOL_BITWIDTH),
                field(&pipeline.match_src, u64::from(u32::from(key.src)), IPV4_ADDR_BITWIDTH),
                field(&pipeline.match_dst, u64::from(u32::from(key.dst)), IPV4_ADDR_BITWIDTH),
            ],
            action: pipeline.flow_action.clone(),
            params: vec![
                param(&pipeline.param_port, self.port.as_u64(), PORT_BITWIDTH),
                param(
                    &pipeline.param_decrement_ttl,
                    u64::from(self.decrement_ttl),
                    DECREMENT_TTL_BITWIDTH,
                ),
                param(&pipeline.param_new_dscp, u64::from(self.new_dscp), DSCP_BITWIDTH),
                param(&pipeline.param_dst_mac, self.dst_mac.to_u64(), MacAddress::BITWIDTH),
            ],
            idle_timeout_ns: u64::try_from(idle_timeout.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowCacheEntry {
    pub key: FlowKey,
    pub action: FlowAction,
    pub idle_timeout: Duration,
    pub rule: RuleHandle,
    pub installed_at: Instant,
}

#[derive(Debug, Default)]
pub struct FlowCache {
    entries: HashMap<FlowKey, FlowCacheEntry>,
    by_rule: HashMap<(String, RuleHandle), FlowKey>,
}

impl FlowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an installed rule, returning the entry it replaced.
    pub fn insert(&mut self, entry: FlowCacheEntry) -> Option<FlowCacheEntry> {
        let previous = self.entries.remove(&entry.key);
        if let Some(old) = &previous {
            self.by_rule.remove(&(old.key.switch.clone(), old.rule.clone()));
        }
        self.by_rule.insert(
            (entry.key.switch.clone(), entry.rule.clone()),
            entry.key.clone(),
        );
        self.entries.insert(entry.key.clone(), entry);
        previous
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowCacheEntry> {
        self.entries.get(key)
    }

    pub fn find_by_rule(&self, switch: &str, rule: &RuleHandle) -> Option<&FlowCacheEntry> {
        self.by_rule
            .get(&(switch.to_string(), rule.clone()))
            .and_then(|key| self.entries.get(key))
    }

    pub fn remove_by_rule(&mut self, switch: &str, rule: &RuleHandle) -> Option<FlowCacheEntry> {
        let key = self.by_rule.remove(&(switch.to_string(), rule.clone()))?;
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowCacheEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(switch: &str, dst: [u8; 4]) -> FlowKey {
        FlowKey {
            switch: switch.to_string(),
            protocol: 17,
            src: Ipv4Addr::new(10, 0, 2, 2),
            dst: Ipv4Addr::from(dst),
        }
    }

    fn action(port: u32) -> FlowAction {
        FlowAction {
            port: PortNumber(port),
            decrement_ttl: true,
            new_dscp: 5,
            dst_mac: "08:00:00:00:01:11".parse().unwrap(),
        }
    }

    fn entry(key: FlowKey, port: u32) -> FlowCacheEntry {
        let rule = action(port)
            .table_entry(&key, &PipelineConfig::default(), Duration::from_secs(3))
            .rule_handle();
        FlowCacheEntry {
            key,
            action: action(port),
            idle_timeout: Duration::from_secs(3),
            rule,
            installed_at: Instant::now(),
        }
    }

    #[test]
    fn test_table_entry_layout() {
        let key = key("s1", [10, 0, 1, 1]);
        let table_entry = action(1).table_entry(&key, &PipelineConfig::default(), Duration::from_secs(3));
        assert_eq!(table_entry.table, "MyIngress.flow_cache");
        assert_eq!(table_entry.action, "MyIngress.cached_action");
        assert_eq!(table_entry.idle_timeout_ns, 3_000_000_000);
        assert_eq!(table_entry.matches[0].value, BitField::new(17, 8));
        assert_eq!(table_entry.matches[2].value, BitField::new(0x0a00_0101, 32));
        let params: Vec<(&str, u64)> = table_entry
            .params
            .iter()
            .map(|p| (p.name.as_str(), p.value.value))
            .collect();
        assert_eq!(
            params,
            vec![
                ("port", 1),
                ("decrement_ttl", 1),
                ("new_dscp", 5),
                ("dst_eth_addr", 0x0800_0000_0111),
            ]
        );
    }

    #[test]
    fn test_insert_and_evict_by_rule() {
        let mut cache = FlowCache::new();
        let e = entry(key("s1", [10, 0, 1, 1]), 1);
        let rule = e.rule.clone();
        assert!(cache.insert(e).is_none());
        assert!(cache.find_by_rule("s1", &rule).is_some());
        assert!(cache.find_by_rule("s2", &rule).is_none());

        assert!(cache.remove_by_rule("s1", &rule).is_some());
        assert!(cache.remove_by_rule("s1", &rule).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_overwrites_same_key() {
        let mut cache = FlowCache::new();
        cache.insert(entry(key("s1", [10, 0, 1, 1]), 1));
        let previous = cache.insert(entry(key("s1", [10, 0, 1, 1]), 4)).unwrap();
        assert_eq!(previous.action.port, PortNumber(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&key("s1", [10, 0, 1, 1])).unwrap().action.port,
            PortNumber(4)
        );
    }

    #[test]
    fn test_same_flow_on_two_switches() {
        let mut cache = FlowCache::new();
        let a = entry(key("s1", [10, 0, 1, 1]), 1);
        let b = entry(key("s2", [10, 0, 1, 1]), 2);
        let rule = a.rule.clone();
        cache.insert(a);
        cache.insert(b);
        assert_eq!(cache.len(), 2);
        cache.remove_by_rule("s1", &rule);
        assert!(cache.find_by_rule("s2", &rule).is_some());
    }
}
