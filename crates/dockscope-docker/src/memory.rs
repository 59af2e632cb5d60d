//! In-memory host for tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use dockscope_types::{Container, StdType};

use crate::source::{ContainerStore, LogFrame, LogSource, LogStream};
use crate::{Error, Result};

/// What a scripted log stream does after its last frame
#[derive(Clone, Debug)]
pub enum LogEnd {
    /// Stay open until the reader drops it
    Hold,
    /// Clean end of stream
    Close,
    /// Read error with the given message
    Fail(String),
}

#[derive(Clone, Debug)]
struct LogScript {
    frames: Vec<LogFrame>,
    end: LogEnd,
}

/// A host whose containers and log output are scripted up front
pub struct InMemoryHost {
    host: String,
    containers: RwLock<Vec<Container>>,
    logs: RwLock<HashMap<String, LogScript>>,
    started: broadcast::Sender<Container>,
}

impl InMemoryHost {
    pub fn new(host: impl Into<String>) -> Self {
        let (started, _) = broadcast::channel(64);
        Self {
            host: host.into(),
            containers: RwLock::new(Vec::new()),
            logs: RwLock::new(HashMap::new()),
            started,
        }
    }

    /// Register a container that already exists
    pub fn add_container(&self, container: Container) {
        self.containers.write().push(container);
    }

    /// Register a container and announce it to subscribers
    pub fn start_container(&self, container: Container) {
        self.add_container(container.clone());
        let _ = self.started.send(container);
    }

    /// Script the output of a container's log stream
    pub fn set_logs(&self, id: &str, frames: Vec<LogFrame>, end: LogEnd) {
        self.logs
            .write()
            .insert(id.to_string(), LogScript { frames, end });
    }

    /// Number of live new-container subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.started.receiver_count()
    }

    fn open(&self, id: &str, std_types: StdType, end_override: Option<LogEnd>) -> Result<LogStream> {
        let script = self
            .logs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let frames: Vec<Result<LogFrame>> = script
            .frames
            .into_iter()
            .filter(|frame| std_types.intersects(frame.stream))
            .map(Ok)
            .collect();

        let frames = stream::iter(frames);
        Ok(match end_override.unwrap_or(script.end) {
            LogEnd::Hold => frames.chain(stream::pending()).boxed(),
            LogEnd::Close => frames.boxed(),
            LogEnd::Fail(message) => frames
                .chain(stream::once(async move { Err(Error::Stream(message)) }))
                .boxed(),
        })
    }
}

#[async_trait]
impl ContainerStore for InMemoryHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn find_container(&self, id: &str) -> Result<Container> {
        self.containers
            .read()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Container>> {
        Ok(self.containers.read().clone())
    }

    fn subscribe_new_containers(&self, cancel: CancellationToken, tx: mpsc::Sender<Container>) {
        let mut started = self.started.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    received = started.recv() => {
                        let Ok(container) = received else {
                            break;
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(container) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl LogSource for InMemoryHost {
    async fn container_logs(
        &self,
        id: &str,
        _since: Option<DateTime<Utc>>,
        std_types: StdType,
    ) -> Result<LogStream> {
        self.open(id, std_types, None)
    }

    async fn container_logs_between_dates(
        &self,
        id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        std_types: StdType,
    ) -> Result<LogStream> {
        self.open(id, std_types, Some(LogEnd::Close))
    }
}
