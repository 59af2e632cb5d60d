use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::Id;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dockscope_docker::LogSource;
use dockscope_types::{Container, ContainerEvent, LogEvent, StdType};

use crate::lifecycle;
use crate::parser::EventGenerator;

/// Output of a tailer worker on the shared fan-in channel
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Log(LogEvent),
    /// Last item of a worker whose stream ended; `worker` is its task
    Stopped {
        event: ContainerEvent,
        worker: Option<Id>,
    },
}

/// How a tailer worker finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TailOutcome {
    /// The log stream could not be opened; nothing was sent
    OpenFailed,
    /// The request went away
    Cancelled,
    /// The container's output ended cleanly
    Ended,
    /// Reading failed after the stream was open
    Failed(String),
}

/// Follow one container's logs into `tx` until its stream ends or `cancel` fires.
///
/// Every hand-off to `tx` suspends while the channel is full, so a slow
/// consumer slows the read of the underlying stream. A clean end is followed
/// by a `container-stopped` event on the same channel, after the last line.
///
/// The engine resumes at whole seconds, so lines stamped before the current
/// run's start are dropped.
pub async fn tail_container(
    source: Arc<dyn LogSource>,
    container: Container,
    std_types: StdType,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamItem>,
) -> TailOutcome {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return TailOutcome::Cancelled,
        opened = source.container_logs(&container.id, container.started_at, std_types) => opened,
    };

    let mut frames = match opened {
        Ok(frames) => frames,
        Err(e) => {
            debug!("could not open logs for container {}: {}", container.name, e);
            return TailOutcome::OpenFailed;
        }
    };

    let mut generator = EventGenerator::new(container.id.clone());
    let run_started = container
        .started_at
        .and_then(|started_at| started_at.timestamp_nanos_opt())
        .unwrap_or(0);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break TailOutcome::Cancelled,

            frame = frames.next() => {
                let (events, ended) = match frame {
                    Some(Ok(frame)) => (current_run(generator.push(&frame), run_started), false),
                    Some(Err(e)) => {
                        if cancel.is_cancelled() {
                            break TailOutcome::Cancelled;
                        }
                        break TailOutcome::Failed(e.to_string());
                    }
                    None => (current_run(generator.finish(), run_started), true),
                };

                if !forward_logs(&tx, &cancel, events).await {
                    break TailOutcome::Cancelled;
                }
                if ended {
                    break TailOutcome::Ended;
                }
            }
        }
    };

    match &outcome {
        TailOutcome::Ended => debug!("stream closed for container {}", container.name),
        TailOutcome::Failed(reason) => {
            warn!("unknown error while streaming {}: {}", container.name, reason)
        }
        _ => {}
    }

    if let Some(event) = lifecycle::on_worker_exit(&container, &outcome) {
        let worker = tokio::task::try_id();
        forward(&tx, &cancel, StreamItem::Stopped { event, worker }).await;
    }

    outcome
}

/// Drop lines of an earlier run; unknown timestamps are kept
fn current_run(mut events: Vec<LogEvent>, run_started: i64) -> Vec<LogEvent> {
    events.retain(|event| event.timestamp == 0 || event.timestamp >= run_started);
    events
}

async fn forward_logs(
    tx: &mpsc::Sender<StreamItem>,
    cancel: &CancellationToken,
    events: Vec<LogEvent>,
) -> bool {
    for event in events {
        if !forward(tx, cancel, StreamItem::Log(event)).await {
            return false;
        }
    }
    true
}

/// Suspending send that gives up on cancellation or a closed channel
async fn forward(tx: &mpsc::Sender<StreamItem>, cancel: &CancellationToken, item: StreamItem) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use dockscope_docker::{InMemoryHost, LogEnd, LogFrame, LogStream};
    use dockscope_types::ContainerEventKind;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Endless output that records how many frames were read
    #[derive(Default)]
    struct CountingSource {
        pulled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LogSource for CountingSource {
        async fn container_logs(
            &self,
            _id: &str,
            _since: Option<DateTime<Utc>>,
            _std_types: StdType,
        ) -> dockscope_docker::Result<LogStream> {
            let pulled = self.pulled.clone();
            Ok(stream::repeat_with(move || {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(LogFrame::stdout("line\n"))
            })
            .boxed())
        }

        async fn container_logs_between_dates(
            &self,
            id: &str,
            from: DateTime<Utc>,
            _to: DateTime<Utc>,
            std_types: StdType,
        ) -> dockscope_docker::Result<LogStream> {
            self.container_logs(id, Some(from), std_types).await
        }
    }

    fn setup(frames: Vec<LogFrame>, end: LogEnd) -> (Arc<InMemoryHost>, Container) {
        let host = Arc::new(InMemoryHost::new("mem"));
        host.set_logs("c1", frames, end);
        (host, Container::new("c1", "web", "mem"))
    }

    async fn drain(mut rx: mpsc::Receiver<StreamItem>) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_clean_end_sends_stop_after_lines() {
        let (host, container) = setup(
            vec![LogFrame::stdout("a\n"), LogFrame::stdout("b")],
            LogEnd::Close,
        );
        let (tx, rx) = mpsc::channel(8);

        let outcome =
            tail_container(host, container, StdType::all(), CancellationToken::new(), tx).await;
        assert_eq!(outcome, TailOutcome::Ended);

        let items = drain(rx).await;
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], StreamItem::Log(e) if e.text() == Some("a")));
        assert!(matches!(&items[1], StreamItem::Log(e) if e.text() == Some("b")));
        assert!(matches!(
            &items[2],
            StreamItem::Stopped { event, .. } if event.name == ContainerEventKind::Stopped
        ));
    }

    #[tokio::test]
    async fn test_open_failure_is_silent() {
        let host = Arc::new(InMemoryHost::new("mem"));
        let (tx, rx) = mpsc::channel(8);

        let outcome = tail_container(
            host,
            Container::new("missing", "gone", "mem"),
            StdType::all(),
            CancellationToken::new(),
            tx,
        )
        .await;

        assert_eq!(outcome, TailOutcome::OpenFailed);
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_is_suppressed() {
        let (host, container) = setup(
            vec![LogFrame::stdout("a\n")],
            LogEnd::Fail("connection reset".into()),
        );
        let (tx, rx) = mpsc::channel(8);

        let outcome =
            tail_container(host, container, StdType::all(), CancellationToken::new(), tx).await;
        assert_eq!(outcome, TailOutcome::Failed("log stream error: connection reset".into()));

        // The line before the failure still arrives, with no lifecycle event
        let items = drain(rx).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], StreamItem::Log(_)));
    }

    #[tokio::test]
    async fn test_cancellation_sends_nothing_more() {
        let (host, container) = setup(vec![LogFrame::stdout("a\n")], LogEnd::Hold);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(tail_container(
            host,
            container,
            StdType::all(),
            cancel.clone(),
            tx,
        ));

        assert!(matches!(rx.recv().await, Some(StreamItem::Log(_))));
        cancel.cancel();

        assert_eq!(worker.await.unwrap(), TailOutcome::Cancelled);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block_cancellation() {
        let (host, container) = setup(
            vec![LogFrame::stdout("a\nb\nc\n")],
            LogEnd::Hold,
        );
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(tail_container(
            host,
            container,
            StdType::all(),
            cancel.clone(),
            tx,
        ));

        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(worker.await.unwrap(), TailOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unread_channel_stops_reading_the_source() {
        let source = Arc::new(CountingSource::default());
        let pulled = source.pulled.clone();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(tail_container(
            source,
            Container::new("c1", "web", "mem"),
            StdType::all(),
            cancel.clone(),
            tx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // One line fills the channel, the next one waits in the worker
        assert!(pulled.load(Ordering::SeqCst) <= 2, "read {} frames", pulled.load(Ordering::SeqCst));

        cancel.cancel();
        assert_eq!(worker.await.unwrap(), TailOutcome::Cancelled);
        assert!(pulled.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_lines_from_previous_run_are_dropped() {
        let host = Arc::new(InMemoryHost::new("mem"));
        host.set_logs(
            "c1",
            vec![
                LogFrame::stdout("2024-01-15T10:30:00.2Z old\n"),
                LogFrame::stdout("2024-01-15T10:30:00.7Z new\n"),
                LogFrame::stdout("untimed\n"),
            ],
            LogEnd::Close,
        );
        let started_at = "2024-01-15T10:30:00.5Z".parse::<DateTime<Utc>>().unwrap();
        let container = Container::new("c1", "web", "mem").with_started_at(Some(started_at));
        let (tx, rx) = mpsc::channel(8);

        let outcome =
            tail_container(host, container, StdType::all(), CancellationToken::new(), tx).await;
        assert_eq!(outcome, TailOutcome::Ended);

        let items = drain(rx).await;
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], StreamItem::Log(e) if e.text() == Some("new")));
        assert!(matches!(&items[1], StreamItem::Log(e) if e.text() == Some("untimed")));
        assert!(matches!(&items[2], StreamItem::Stopped { .. }));
    }
}
