//! Per-request coordinator merging container logs into one SSE stream.
//!
//! The multiplexer owns the response sink. Members arrive on a channel fed by
//! a [`MembershipFilter`](crate::MembershipFilter) or the caller, each gets
//! one tailer worker, and every worker writes into a single fan-in channel
//! the coordinator drains into the sink, interleaved with keepalive pings.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, debug_span, error, warn};

use dockscope_docker::LogClients;
use dockscope_types::{Container, ContainerEvent, StdType};

use crate::lifecycle;
use crate::sse::{self, FrameSink, SinkClosed};
use crate::stream::{StreamItem, TailOutcome, tail_container};

/// Default interval between keepalive comments
pub const KEEPALIVE: Duration = Duration::from_secs(5);

/// Errors detected before anything is written
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("at least one of stdout or stderr is required")]
    NoStdType,

    #[error("streaming unsupported by the response writer")]
    FlushUnsupported,
}

/// Tunables of a single stream
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Quiet time before a `:ping` comment is sent
    pub keepalive: Duration,

    /// Capacity of the channel shared by all workers
    pub fan_in_buffer: usize,

    /// Upper bound on concurrently tailed containers, unlimited when `None`
    pub max_workers: Option<usize>,

    /// Log a runtime sample at debug level when the stream ends
    pub runtime_stats: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE,
            fan_in_buffer: 1,
            max_workers: None,
            runtime_stats: true,
        }
    }
}

/// Merges the logs of a changing set of containers into one frame sink
pub struct StreamMultiplexer<S> {
    clients: LogClients,
    std_types: StdType,
    sink: S,
    cancel: CancellationToken,
    settings: StreamSettings,

    /// When the request began; later starts are announced
    started: DateTime<Utc>,

    workers: JoinSet<(String, TailOutcome)>,

    /// Live worker per container id
    active: HashMap<String, Id>,
}

impl<S: FrameSink> StreamMultiplexer<S> {
    pub fn new(
        clients: LogClients,
        std_types: StdType,
        sink: S,
        cancel: CancellationToken,
        settings: StreamSettings,
    ) -> Result<Self, StreamError> {
        if std_types.is_empty() {
            return Err(StreamError::NoStdType);
        }
        if !sink.supports_flush() {
            return Err(StreamError::FlushUnsupported);
        }

        Ok(Self {
            clients,
            std_types,
            sink,
            cancel,
            settings,
            started: Utc::now(),
            workers: JoinSet::new(),
            active: HashMap::new(),
        })
    }

    /// Stream until the request is cancelled or the client goes away.
    ///
    /// Closing `members` only stops admissions; the workers already running
    /// keep the stream alive.
    pub async fn run(mut self, mut members: mpsc::Receiver<Container>) {
        let (items_tx, mut items_rx) = mpsc::channel(self.settings.fan_in_buffer.max(1));

        let period = self.settings.keepalive;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut members_open = true;

        loop {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("stream cancelled");
                    break;
                }

                member = members.recv(), if members_open => match member {
                    Some(container) => self.admit(container, &items_tx).await,
                    None => {
                        members_open = false;
                        Ok(())
                    }
                },

                Some(item) = items_rx.recv() => self.emit(item).await,

                _ = keepalive.tick() => self.sink.send_frame(sse::ping()).await,

                Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    self.reap(joined);
                    Ok(())
                }
            };

            if sent.is_err() {
                debug!("client disconnected");
                break;
            }
        }

        self.cancel.cancel();
        if self.settings.runtime_stats {
            log_runtime_stats(self.workers.len());
        }
        self.workers.detach_all();
    }

    async fn admit(
        &mut self,
        container: Container,
        items: &mpsc::Sender<StreamItem>,
    ) -> Result<(), SinkClosed> {
        // Workers that already finished no longer count as live
        while let Some(joined) = self.workers.try_join_next_with_id() {
            self.reap(joined);
        }

        if self.active.contains_key(&container.id) {
            debug!("container {} is already streaming", container.name);
            return Ok(());
        }

        if let Some(max) = self.settings.max_workers {
            if self.active.len() >= max {
                warn!(
                    "worker limit {} reached, not streaming container {}",
                    max, container.name
                );
                return Ok(());
            }
        }

        // Announced on the wire before the worker can produce anything
        if let Some(event) = lifecycle::on_member_arrival(&container, self.started) {
            self.send_event(&event).await?;
        }

        let Some(source) = self.clients.get(&container.host).cloned() else {
            debug!("no log client for host {}", container.host);
            return Ok(());
        };

        let id = container.id.clone();
        let span = debug_span!("tail", container = %container.name, host = %container.host);
        let worker = tail_container(
            source,
            container,
            self.std_types,
            self.cancel.child_token(),
            items.clone(),
        );

        let key = id.clone();
        let handle = self
            .workers
            .spawn(async move { (key, worker.await) }.instrument(span));
        self.active.insert(id, handle.id());

        Ok(())
    }

    async fn emit(&mut self, item: StreamItem) -> Result<(), SinkClosed> {
        match item {
            StreamItem::Log(event) => match sse::encode_log(&event) {
                Ok(frame) => self.sink.send_frame(frame).await,
                Err(e) => {
                    error!("could not encode log event: {}", e);
                    Ok(())
                }
            },
            StreamItem::Stopped { event, worker } => {
                // Nothing follows a stop, so the container may be admitted again
                if let Some(task) = worker {
                    self.active.retain(|_, id| *id != task);
                }
                self.send_event(&event).await
            }
        }
    }

    async fn send_event(&mut self, event: &ContainerEvent) -> Result<(), SinkClosed> {
        match sse::encode_container_event(event) {
            Ok(frame) => self.sink.send_frame(frame).await,
            Err(e) => {
                error!("could not encode container event: {}", e);
                Ok(())
            }
        }
    }

    /// Drop the registry entry of a finished worker
    fn reap(&mut self, joined: Result<(Id, (String, TailOutcome)), JoinError>) {
        let task = match &joined {
            Ok((task, (id, outcome))) => {
                debug!("worker for {} finished: {:?}", id, outcome);
                *task
            }
            Err(e) => {
                if e.is_panic() {
                    error!("log worker panicked: {}", e);
                }
                e.id()
            }
        };

        self.active.retain(|_, id| *id != task);
    }
}

fn log_runtime_stats(live_workers: usize) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let metrics = handle.metrics();
        debug!(
            live_workers,
            runtime_workers = metrics.num_workers(),
            alive_tasks = metrics.num_alive_tasks(),
            "stream finished"
        );
    }
}
