//! Switch connection adapter.
//!
//! [`SwitchConnection`] wraps one control channel. Every blocking channel
//! call runs on the blocking thread pool so a stalled switch never holds up
//! the listeners of other switches or the dispatcher. Writes go through the
//! [`RetryPolicy`]; setup calls do not.

use crate::channel::{
    BitField, ChannelConnector, ChannelError, ChannelResult, CloneSessionEntry, CounterEntry,
    ForwardingPipeline, RuleHandle, StatusCode, SwitchChannel, SwitchIdentity, TableEntry,
};
use crate::error::{ControllerError, Result};
use crate::notification::{EventKind, Notification, NotificationPayload, NotificationSender};
use crate::recovery::RetryPolicy;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Runs a channel call on the blocking pool.
async fn blocking<T, F>(call: F) -> ChannelResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ChannelResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(e) => Err(ChannelError::new(
            StatusCode::Internal,
            format!("blocking channel call failed: {}", e),
        )),
    }
}

pub struct SwitchConnection {
    identity: SwitchIdentity,
    channel: Arc<dyn SwitchChannel>,
    retry: RetryPolicy,
}

impl fmt::Debug for SwitchConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchConnection")
            .field("identity", &self.identity)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SwitchConnection {
    /// Wraps an already-open channel.
    pub fn new(channel: Arc<dyn SwitchChannel>, retry: RetryPolicy) -> Self {
        Self {
            identity: channel.identity().clone(),
            channel,
            retry,
        }
    }

    /// Opens a channel to `identity`. Not retried.
    #[instrument(skip(connector, retry), fields(switch = %identity.name))]
    pub async fn connect(
        identity: &SwitchIdentity,
        connector: Arc<dyn ChannelConnector>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let target = identity.clone();
        let channel = blocking(move || connector.connect(&target))
            .await
            .map_err(|source| ControllerError::Channel {
                switch: identity.name.clone(),
                operation: "connect",
                source,
            })?;
        info!(
            address = %identity.address,
            device_id = %identity.device_id,
            "connected"
        );
        Ok(Self::new(channel, retry))
    }

    pub fn identity(&self) -> &SwitchIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    fn fatal(&self, operation: &'static str) -> impl FnOnce(ChannelError) -> ControllerError + '_ {
        move |source| ControllerError::Channel {
            switch: self.identity.name.clone(),
            operation,
            source,
        }
    }

    /// Becomes primary controller for the device.
    pub async fn arbitrate(&self, election_id: u64) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        blocking(move || channel.arbitrate(election_id))
            .await
            .map_err(self.fatal("arbitrate"))?;
        debug!(switch = %self.name(), election_id, "mastership acquired");
        Ok(())
    }

    pub async fn install_pipeline(&self, pipeline: Arc<ForwardingPipeline>) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        blocking(move || channel.set_forwarding_pipeline(&pipeline))
            .await
            .map_err(self.fatal("install_pipeline"))?;
        info!(switch = %self.name(), "forwarding pipeline installed");
        Ok(())
    }

    /// Creates the punt clone session. An existing session counts as success.
    pub async fn create_clone_session(&self, session: CloneSessionEntry) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        let session_id = session.session_id;
        match blocking(move || channel.write_clone_session(&session)).await {
            Ok(()) => {
                info!(switch = %self.name(), session_id, "clone session created");
                Ok(())
            }
            Err(err) if err.code == StatusCode::AlreadyExists => {
                info!(switch = %self.name(), session_id, "clone session already present");
                Ok(())
            }
            Err(err) => Err(self.fatal("create_clone_session")(err)),
        }
    }

    #[instrument(skip_all, fields(switch = %self.identity.name))]
    pub async fn write_rule(&self, entry: TableEntry) -> Result<RuleHandle> {
        self.retry
            .retry(self.name(), "write_rule", || {
                let channel = Arc::clone(&self.channel);
                let entry = entry.clone();
                blocking(move || channel.write_table_entry(&entry))
            })
            .await
    }

    /// Deletes a rule. A rule the switch no longer has counts as deleted.
    #[instrument(skip_all, fields(switch = %self.identity.name, rule = %rule))]
    pub async fn delete_rule(&self, rule: &RuleHandle) -> Result<()> {
        self.retry
            .retry(self.name(), "delete_rule", || {
                let channel = Arc::clone(&self.channel);
                let rule = rule.clone();
                async move {
                    match blocking(move || channel.delete_table_entry(&rule)).await {
                        Err(err) if err.code == StatusCode::NotFound => {
                            debug!("rule already absent on switch");
                            Ok(())
                        }
                        other => other,
                    }
                }
            })
            .await
    }

    #[instrument(skip_all, fields(switch = %self.identity.name, len = payload.len()))]
    pub async fn emit_packet(&self, payload: Bytes, metadata: Vec<BitField>) -> Result<()> {
        self.retry
            .retry(self.name(), "emit_packet", || {
                let channel = Arc::clone(&self.channel);
                let payload = payload.clone();
                let metadata = metadata.clone();
                blocking(move || channel.packet_out(&payload, &metadata))
            })
            .await
    }

    /// Reads one counter cell, or all cells with `index = None`.
    pub async fn read_counters(&self, counter: &str, index: Option<u64>) -> Result<Vec<CounterEntry>> {
        let channel = Arc::clone(&self.channel);
        let counter = counter.to_string();
        blocking(move || channel.read_counters(&counter, index))
            .await
            .map_err(self.fatal("read_counters"))
    }

    pub async fn read_table_entries(&self) -> Result<Vec<TableEntry>> {
        let channel = Arc::clone(&self.channel);
        blocking(move || channel.read_table_entries())
            .await
            .map_err(self.fatal("read_table_entries"))
    }

    /// Waits for the next event of `kind`.
    pub async fn next_event(&self, kind: EventKind) -> ChannelResult<NotificationPayload> {
        let channel = Arc::clone(&self.channel);
        match kind {
            EventKind::PacketIn => blocking(move || channel.packet_in())
                .await
                .map(NotificationPayload::PacketIn),
            EventKind::IdleTimeout => blocking(move || channel.idle_timeout_notification())
                .await
                .map(NotificationPayload::IdleTimeout),
        }
    }

    /// Closes the channel, waking any blocked listener call.
    pub fn close(&self) {
        self.channel.close();
        debug!(switch = %self.name(), "channel closed");
    }
}

/// Spawns one listener per event kind for `switch` into `tasks`.
pub fn spawn_listeners(
    switch: &Arc<SwitchConnection>,
    queue: &NotificationSender,
    shutdown: &CancellationToken,
    tasks: &mut JoinSet<Result<()>>,
) {
    for kind in EventKind::ALL {
        tasks.spawn(listen(
            Arc::clone(switch),
            kind,
            queue.clone(),
            shutdown.clone(),
        ));
    }
}

/// Forwards events of one kind from one switch into the merge queue until
/// shutdown or a fatal channel error.
async fn listen(
    switch: Arc<SwitchConnection>,
    kind: EventKind,
    queue: NotificationSender,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!(switch = %switch.name(), %kind, "listener started");
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = switch.next_event(kind) => event,
        };

        match event {
            Ok(payload) => {
                if queue.push(Notification::new(Arc::clone(&switch), payload)).is_err() {
                    debug!(switch = %switch.name(), %kind, "merge queue closed");
                    break;
                }
            }
            Err(_) if shutdown.is_cancelled() => break,
            Err(err) if err.is_retryable() => {
                if let Some(metrics) = switch.retry.metrics() {
                    metrics.record_listener_error();
                }
                warn!(
                    switch = %switch.name(),
                    %kind,
                    code = %err.code,
                    "listener interrupted, resuming in {:?}: {}",
                    switch.retry.interval(),
                    err.message
                );
                if switch.retry.backoff().await.is_err() {
                    break;
                }
            }
            Err(source) => {
                if let Some(metrics) = switch.retry.metrics() {
                    metrics.record_listener_error();
                }
                error!(
                    switch = %switch.name(),
                    %kind,
                    code = %source.code,
                    "listener failed: {}",
                    source.message
                );
                return Err(ControllerError::Channel {
                    switch: switch.name().to_string(),
                    operation: kind.as_str(),
                    source,
                });
            }
        }
    }
    debug!(switch = %switch.name(), %kind, "listener stopped");
    Ok(())
}
