use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dockscope_types::{Container, StdType};

use crate::Result;

/// One demultiplexed chunk of container output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFrame {
    /// Single stream bit the chunk was read from
    pub stream: StdType,
    pub bytes: Bytes,
}

impl LogFrame {
    pub fn new(stream: StdType, bytes: impl Into<Bytes>) -> Self {
        Self {
            stream,
            bytes: bytes.into(),
        }
    }

    pub fn stdout(text: &str) -> Self {
        Self::new(StdType::STDOUT, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn stderr(text: &str) -> Self {
        Self::new(StdType::STDERR, Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Live or historical log output of one container. Dropping it closes the
/// underlying engine request.
pub type LogStream = BoxStream<'static, Result<LogFrame>>;

/// Per-host log clients, looked up by [`Container::host`]
pub type LogClients = Arc<HashMap<String, Arc<dyn LogSource>>>;

/// Answers which containers exist on a host and announces new ones
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Host identifier stamped on every container of this store
    fn host(&self) -> &str;

    async fn find_container(&self, id: &str) -> Result<Container>;

    /// All containers currently known, in engine order
    async fn list(&self) -> Result<Vec<Container>>;

    /// Push every container started from now on into `tx` until `cancel` fires.
    /// Returns immediately; the subscription runs on its own task.
    fn subscribe_new_containers(&self, cancel: CancellationToken, tx: mpsc::Sender<Container>);
}

/// Opens log streams against one host
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Follow the container's output from `since` onwards
    async fn container_logs(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        std_types: StdType,
    ) -> Result<LogStream>;

    /// Finite output between two instants
    async fn container_logs_between_dates(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        std_types: StdType,
    ) -> Result<LogStream>;
}
