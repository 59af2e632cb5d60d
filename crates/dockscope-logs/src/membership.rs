use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use dockscope_docker::ContainerStore;
use dockscope_types::Container;

/// Which containers belong to a stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    /// One container, followed across restarts
    Container(String),
    /// A fixed set of containers viewed together
    Containers(HashSet<String>),
    /// Running containers of a swarm service
    Service(String),
    /// Running containers of a swarm stack
    Stack(String),
    /// Running containers of a logical group
    Group(String),
}

impl Membership {
    /// Check if a container belongs to this stream
    pub fn matches(&self, container: &Container) -> bool {
        match self {
            Self::Container(id) => container.id == *id,
            Self::Containers(ids) => ids.contains(&container.id),
            Self::Service(name) => {
                container.is_running() && container.service() == Some(name.as_str())
            }
            Self::Stack(name) => container.is_running() && container.stack() == Some(name.as_str()),
            Self::Group(name) => {
                container.is_running() && container.group.as_deref() == Some(name.as_str())
            }
        }
    }

    /// Label selections start from the containers already running; id
    /// selections are seeded by the caller
    fn enumerates(&self) -> bool {
        matches!(self, Self::Service(_) | Self::Stack(_) | Self::Group(_))
    }

    /// The merged id view is fixed for the lifetime of the request
    fn subscribes(&self) -> bool {
        !matches!(self, Self::Containers(_))
    }
}

/// Feeds a stream's membership channel from the container stores
pub struct MembershipFilter {
    stores: Vec<Arc<dyn ContainerStore>>,
    membership: Membership,
}

impl MembershipFilter {
    pub fn new(stores: Vec<Arc<dyn ContainerStore>>, membership: Membership) -> Self {
        Self { stores, membership }
    }

    /// Run discovery on its own task until `cancel` fires
    pub fn spawn(self, tx: mpsc::Sender<Container>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(tx, cancel).await;
        })
    }

    async fn run(self, tx: mpsc::Sender<Container>, cancel: CancellationToken) {
        // Subscribe before listing so nothing starting in between is missed;
        // the multiplexer ignores a container it already tails
        let mut started = if self.membership.subscribes() {
            let (started_tx, started_rx) = mpsc::channel(self.stores.len().max(1));
            for store in &self.stores {
                store.subscribe_new_containers(cancel.clone(), started_tx.clone());
            }
            Some(started_rx)
        } else {
            None
        };

        if self.membership.enumerates() {
            for store in &self.stores {
                let list = match store.list().await {
                    Ok(list) => list,
                    Err(e) => {
                        error!("error while listing containers on {}: {}", store.host(), e);
                        return;
                    }
                };

                for container in list {
                    if self.membership.matches(&container) && !push(&tx, &cancel, container).await {
                        return;
                    }
                }
            }
        }

        let Some(started) = started.as_mut() else {
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                container = started.recv() => {
                    match container {
                        Some(container) if self.membership.matches(&container) => {
                            if !push(&tx, &cancel, container).await {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        debug!("closing container channel for {:?}", self.membership);
    }
}

/// Hand a member to the multiplexer without outliving the request
async fn push(tx: &mpsc::Sender<Container>, cancel: &CancellationToken, container: Container) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(container) => sent.is_ok(),
    }
}
