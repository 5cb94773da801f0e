//! Controller lifecycle: setup, run, orderly shutdown.

use crate::channel::{ChannelConnector, CloneSessionEntry, ForwardingPipeline, Replica};
use crate::config::ControllerConfig;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{ControllerError, Result};
use crate::metrics::MetricsCollector;
use crate::notification::merge_queue;
use crate::recovery::RetryPolicy;
use crate::schema::PipelineSchema;
use crate::switch::{spawn_listeners, SwitchConnection};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn task_result<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.unwrap_or_else(|e| Err(ControllerError::Task(e.to_string())))
}

/// A configured controller that has not touched any switch yet.
pub struct Controller {
    config: Arc<ControllerConfig>,
    schema: Arc<PipelineSchema>,
    connector: Arc<dyn ChannelConnector>,
    shutdown: CancellationToken,
    metrics: MetricsCollector,
}

impl Controller {
    pub fn new(config: ControllerConfig, connector: Arc<dyn ChannelConnector>) -> Result<Self> {
        config.validate()?;
        let schema = PipelineSchema::from_config(&config.pipeline)?;
        Ok(Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            connector,
            shutdown: CancellationToken::new(),
            metrics: MetricsCollector::new()?,
        })
    }

    /// Cancelling this token starts an orderly shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Arc<ControllerConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    fn clone_session(&self) -> CloneSessionEntry {
        CloneSessionEntry {
            session_id: self.config.punt.clone_session_id,
            replicas: vec![Replica {
                egress_port: self.config.punt.cpu_port,
                instance: self.config.punt.replica_instance,
            }],
            packet_length_bytes: self.config.punt.truncation_bytes,
        }
    }

    /// Sets up every switch in order, then starts the listeners and the
    /// dispatcher. Any setup failure closes the switches already connected.
    pub async fn start(self, pipeline: ForwardingPipeline) -> Result<RunningController> {
        let retry = RetryPolicy::new(self.config.retry_interval(), self.shutdown.clone())
            .with_metrics(self.metrics.clone());
        let pipeline = Arc::new(pipeline);
        let mut switches: Vec<Arc<SwitchConnection>> = Vec::with_capacity(self.config.switches.len());

        for switch_config in &self.config.switches {
            let identity = switch_config.identity();
            let setup = async {
                let conn = SwitchConnection::connect(
                    &identity,
                    Arc::clone(&self.connector),
                    retry.clone(),
                )
                .await?;
                let conn = Arc::new(conn);
                switches.push(Arc::clone(&conn));
                conn.arbitrate(self.config.election_id).await?;
                conn.install_pipeline(Arc::clone(&pipeline)).await?;
                conn.create_clone_session(self.clone_session()).await?;
                Ok::<_, ControllerError>(())
            };
            if let Err(e) = setup.await {
                error!(switch = %identity.name, error = %e, "switch setup failed");
                for conn in &switches {
                    conn.close();
                }
                return Err(e);
            }
            info!(switch = %identity, "switch ready");
        }

        let (queue, inbox) = merge_queue();
        let mut listeners = JoinSet::new();
        for conn in &switches {
            spawn_listeners(conn, &queue, &self.shutdown, &mut listeners);
        }
        drop(queue);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.config),
            Arc::clone(&self.schema),
            self.metrics.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(inbox, self.shutdown.clone()));
        info!(
            switches = switches.len(),
            listeners = listeners.len(),
            "controller running"
        );

        Ok(RunningController {
            switches,
            listeners,
            dispatcher,
            shutdown: self.shutdown,
            metrics: self.metrics,
        })
    }
}

/// A controller whose listeners and dispatcher are running.
pub struct RunningController {
    switches: Vec<Arc<SwitchConnection>>,
    listeners: JoinSet<Result<()>>,
    dispatcher: JoinHandle<Result<DispatchStats>>,
    shutdown: CancellationToken,
    metrics: MetricsCollector,
}

impl RunningController {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn switches(&self) -> &[Arc<SwitchConnection>] {
        &self.switches
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Runs until the shutdown token is cancelled or a fatal error occurs,
    /// then closes every channel and waits for all tasks.
    ///
    /// Returns the first fatal error, if any.
    pub async fn run_until_shutdown(self) -> Result<DispatchStats> {
        let RunningController {
            switches,
            mut listeners,
            mut dispatcher,
            shutdown,
            ..
        } = self;
        let mut failure: Option<ControllerError> = None;

        let dispatched = loop {
            tokio::select! {
                joined = &mut dispatcher => break task_result(joined),
                Some(joined) = listeners.join_next(), if !listeners.is_empty() => {
                    if let Err(e) = task_result(joined) {
                        if failure.is_none() {
                            error!(switch = e.switch().unwrap_or("-"), error = %e, "fatal listener error, shutting down");
                            failure = Some(e);
                        }
                        shutdown.cancel();
                    }
                }
            }
        };
        shutdown.cancel();

        for conn in &switches {
            conn.close();
        }
        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = task_result(joined) {
                warn!(error = %e, "listener failed during shutdown");
            }
        }
        info!("all switch channels closed");

        match (failure, dispatched) {
            (Some(e), _) => Err(e),
            (None, result) => result,
        }
    }
}
