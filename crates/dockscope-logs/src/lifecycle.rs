//! Lifecycle events derived from membership and worker outcomes.
//!
//! There is no liveness polling: a container is reported started when it
//! joins a stream with a start time after the stream began, and stopped when
//! its log stream ends cleanly.

use chrono::{DateTime, Utc};

use dockscope_types::{Container, ContainerEvent};

use crate::stream::TailOutcome;

/// `container-started` for a member whose current run began after the request
pub fn on_member_arrival(
    container: &Container,
    request_started: DateTime<Utc>,
) -> Option<ContainerEvent> {
    container
        .started_at
        .filter(|started_at| *started_at > request_started)
        .map(|_| ContainerEvent::started(container))
}

/// `container-stopped` for a worker whose stream reached its end
pub fn on_worker_exit(container: &Container, outcome: &TailOutcome) -> Option<ContainerEvent> {
    match outcome {
        TailOutcome::Ended => Some(ContainerEvent::stopped(container)),
        TailOutcome::Cancelled | TailOutcome::OpenFailed | TailOutcome::Failed(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dockscope_types::ContainerEventKind;

    fn container(started_at: Option<DateTime<Utc>>) -> Container {
        Container::new("c1", "web", "localhost").with_started_at(started_at)
    }

    #[test]
    fn test_started_after_request() {
        let request = Utc::now();
        let event = on_member_arrival(&container(Some(request + Duration::seconds(1))), request);
        assert_eq!(event.map(|e| e.name), Some(ContainerEventKind::Started));
    }

    #[test]
    fn test_started_before_request_is_quiet() {
        let request = Utc::now();
        assert!(on_member_arrival(&container(Some(request - Duration::seconds(1))), request).is_none());
        assert!(on_member_arrival(&container(Some(request)), request).is_none());
        assert!(on_member_arrival(&container(None), request).is_none());
    }

    #[test]
    fn test_stopped_only_on_clean_end() {
        let c = container(None);
        let event = on_worker_exit(&c, &TailOutcome::Ended).unwrap();
        assert_eq!(event.name, ContainerEventKind::Stopped);
        assert_eq!(event.actor_id, "c1");
        assert_eq!(event.host, "localhost");

        assert!(on_worker_exit(&c, &TailOutcome::Cancelled).is_none());
        assert!(on_worker_exit(&c, &TailOutcome::OpenFailed).is_none());
        assert!(on_worker_exit(&c, &TailOutcome::Failed("reset".into())).is_none());
    }
}
