//! Docker engine client for dockscope

use std::collections::HashMap;
use std::pin::pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions};
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dockscope_types::{Container, StdType};

use crate::source::{ContainerStore, LogFrame, LogSource, LogStream};
use crate::{Error, Result};

/// Seconds bollard waits on engine requests before giving up
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker engine wrapper for one host
#[derive(Clone)]
pub struct DockerHost {
    host: String,
    docker: Docker,
}

impl DockerHost {
    /// Connect to an engine. `None` uses the local defaults (socket or named
    /// pipe), `unix://` paths a specific socket, anything else is treated as
    /// an HTTP endpoint.
    pub fn connect(host: impl Into<String>, endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults()?,
            Some(path) if path.starts_with("unix://") => Docker::connect_with_socket(
                path,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?,
            Some(addr) => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
        };

        Ok(Self {
            host: host.into(),
            docker,
        })
    }

    /// Check that the engine answers
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<Container> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => container_from_inspect(&self.host, inspect),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(Error::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a log request, surfacing errors the engine reports up front
    async fn open_logs(&self, id: &str, options: LogsOptions<String>) -> Result<LogStream> {
        let frames = self
            .docker
            .logs(id, Some(options))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(output) => frame_from_output(output).map(Ok),
                    Err(e) => Some(Err(Error::from(e))),
                })
            })
            .boxed();

        // The engine answers a bad request with an error as the first item
        let (first, rest) = frames.into_future().await;
        match first {
            Some(Err(Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }))) => Err(Error::NotFound(id.to_string())),
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) => Ok(stream::once(future::ready(Ok(frame))).chain(rest).boxed()),
            None => Ok(stream::empty().boxed()),
        }
    }
}

#[async_trait]
impl ContainerStore for DockerHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn find_container(&self, id: &str) -> Result<Container> {
        self.inspect(id).await
    }

    async fn list(&self) -> Result<Vec<Container>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        // Summaries lack the start time, so inspect each one
        let inspected = future::join_all(
            summaries
                .iter()
                .filter_map(|summary| summary.id.as_deref())
                .map(|id| self.inspect(id)),
        )
        .await;

        Ok(inspected
            .into_iter()
            .filter_map(|result| match result {
                Ok(container) => Some(container),
                Err(e) => {
                    // Removed between list and inspect
                    debug!("skipping container while listing: {}", e);
                    None
                }
            })
            .collect())
    }

    fn subscribe_new_containers(&self, cancel: CancellationToken, tx: mpsc::Sender<Container>) {
        let this = self.clone();

        // The events request is only sent once the task polls it; starts in
        // between are replayed by the engine from this point
        let since = events_since(Utc::now());

        tokio::spawn(async move {
            let filters = HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                ("event".to_string(), vec!["start".to_string()]),
            ]);
            let mut events = pin!(this.docker.events(Some(EventsOptions::<String> {
                since: Some(since),
                filters,
                ..Default::default()
            })));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = events.next() => {
                        match event {
                            Some(Ok(message)) => {
                                let Some(id) = message.actor.and_then(|actor| actor.id) else {
                                    continue;
                                };

                                let container = match this.inspect(&id).await {
                                    Ok(container) => container,
                                    Err(e) => {
                                        debug!("could not inspect started container {}: {}", id, e);
                                        continue;
                                    }
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
                            Some(Err(e)) => {
                                warn!("event subscription on {} failed: {}", this.host, e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            debug!("closing container subscription for {}", this.host);
        });
    }
}

#[async_trait]
impl LogSource for DockerHost {
    async fn container_logs(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        std_types: StdType,
    ) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: std_types.contains(StdType::STDOUT),
            stderr: std_types.contains(StdType::STDERR),
            // Whole seconds only; the tailer drops lines older than the run
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            timestamps: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.open_logs(id, options).await
    }

    async fn container_logs_between_dates(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        std_types: StdType,
    ) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: std_types.contains(StdType::STDOUT),
            stderr: std_types.contains(StdType::STDERR),
            since: from.timestamp(),
            until: to.timestamp(),
            timestamps: true,
            tail: "all".to_string(),
        };

        self.open_logs(id, options).await
    }
}

/// Convert an engine inspect response into a container snapshot
fn container_from_inspect(host: &str, inspect: ContainerInspectResponse) -> Result<Container> {
    let id = inspect
        .id
        .ok_or_else(|| Error::InvalidContainer("inspect response without id".to_string()))?;
    let name = inspect
        .name
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();

    let (labels, tty) = match inspect.config {
        Some(config) => (config.labels.unwrap_or_default(), config.tty.unwrap_or(false)),
        None => (HashMap::new(), false),
    };

    let (state, started_at) = match inspect.state {
        Some(state) => (
            state.status.map(|s| s.to_string()).unwrap_or_default(),
            state.started_at.as_deref().and_then(parse_started_at),
        ),
        None => (String::new(), None),
    };

    let mut container = Container::new(id, name, host)
        .with_labels(labels)
        .with_state(state)
        .with_started_at(started_at);
    container.tty = tty;

    Ok(container)
}

/// Engine start times are RFC 3339; never-started containers report year 1
fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0)
}

/// Engine `since` value with sub-second precision
fn events_since(at: DateTime<Utc>) -> String {
    format!("{}.{:09}", at.timestamp(), at.timestamp_subsec_nanos())
}

fn frame_from_output(output: LogOutput) -> Option<LogFrame> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(LogFrame::new(StdType::STDOUT, message))
        }
        LogOutput::StdErr { message } => Some(LogFrame::new(StdType::STDERR, message)),
        LogOutput::StdIn { .. } => None,
    }
}
