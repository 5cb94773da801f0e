//! Notification merge queue.
//!
//! Every listener owns a [`NotificationSender`]; the dispatcher owns the
//! single [`NotificationReceiver`]. Pushing never blocks. Order is arrival
//! order at the queue, FIFO per producer, with nothing promised across
//! producers.

use crate::channel::{IdleTimeoutNotification, RawPacketIn};
use crate::switch::SwitchConnection;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// The two inbound event sources of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketIn,
    IdleTimeout,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::PacketIn, EventKind::IdleTimeout];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PacketIn => "packet_in",
            EventKind::IdleTimeout => "idle_timeout",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw event payload as delivered by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    PacketIn(RawPacketIn),
    IdleTimeout(IdleTimeoutNotification),
}

impl NotificationPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            NotificationPayload::PacketIn(_) => EventKind::PacketIn,
            NotificationPayload::IdleTimeout(_) => EventKind::IdleTimeout,
        }
    }
}

/// One event from one switch. Immutable once created.
#[derive(Debug)]
pub struct Notification {
    switch: Arc<SwitchConnection>,
    payload: NotificationPayload,
    received_at: Instant,
}

impl Notification {
    pub fn new(switch: Arc<SwitchConnection>, payload: NotificationPayload) -> Self {
        Self {
            switch,
            payload,
            received_at: Instant::now(),
        }
    }

    pub fn switch(&self) -> &Arc<SwitchConnection> {
        &self.switch
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &NotificationPayload {
        &self.payload
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn into_parts(self) -> (Arc<SwitchConnection>, NotificationPayload) {
        (self.switch, self.payload)
    }
}

/// Producer half of the merge queue.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSender {
    /// Enqueues without blocking. Hands the notification back if the
    /// dispatcher is gone.
    pub fn push(&self, notification: Notification) -> Result<(), Notification> {
        self.tx.send(notification).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the merge queue.
#[derive(Debug)]
pub struct NotificationReceiver {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationReceiver {
    /// Waits for the next notification. `None` once every sender is dropped
    /// and the queue is drained.
    pub async fn pop(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

pub fn merge_queue() -> (NotificationSender, NotificationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotificationSender { tx }, NotificationReceiver { rx })
}
