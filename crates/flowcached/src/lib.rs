//! Reactive flow-cache controller for P4Runtime switches.
//!
//! The dataplane punts the first packet of every unknown flow to the
//! controller. The controller sends the packet back out on the port the
//! routing table selects and installs an idle-timed flow rule on the ingress
//! switch, so later packets of the flow stay in hardware. When a rule goes
//! idle the switch reports it and the controller deletes it and forgets it.
//!
//! # Architecture
//!
//! ```text
//!  switch s1 ──┬─ packet_in listener ────┐
//!              └─ idle_timeout listener ─┤
//!  switch s2 ──┬─ packet_in listener ────┤   merge     ┌────────────┐
//!              └─ idle_timeout listener ─┼──  queue ──▶│ dispatcher │── writes / packet-out
//!  switch sN ──┬─ ...                    │             │ flow cache │   back through the
//!              └─ ...                 ───┘             └────────────┘   switch adapters
//! ```
//!
//! Every blocking channel call runs on the blocking pool. Transient channel
//! failures are retried at a fixed interval; fatal ones shut the whole
//! controller down after closing every channel.

pub mod channel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod flow_cache;
pub mod metrics;
pub mod notification;
pub mod packet;
pub mod recovery;
pub mod schema;
pub mod switch;

pub use config::ControllerConfig;
pub use controller::{Controller, RunningController};
pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher};
pub use error::{ControllerError, Result};
pub use metrics::MetricsCollector;
