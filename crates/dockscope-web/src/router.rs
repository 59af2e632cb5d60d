use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use dockscope_docker::{ContainerStore, LogClients, LogSource};
use dockscope_logs::{ChannelSink, Membership, MembershipFilter, StreamMultiplexer, StreamSettings};
use dockscope_types::Container;

use crate::body::{channel_body, event_stream_headers};
use crate::error::ApiError;
use crate::export;
use crate::query::LogQuery;

/// Capacity of label-based membership channels
pub const MEMBERSHIP_BUFFER: usize = 10;

/// Shared by every request; the host maps never change after startup
#[derive(Clone)]
pub struct AppState {
    stores: Arc<HashMap<String, Arc<dyn ContainerStore>>>,
    clients: LogClients,
    settings: StreamSettings,
    membership_buffer: usize,

    /// Parent of every request token
    shutdown: CancellationToken,
}

impl AppState {
    /// Register hosts that both list containers and serve their logs
    pub fn new<H>(hosts: Vec<Arc<H>>, shutdown: CancellationToken) -> Self
    where
        H: ContainerStore + LogSource + 'static,
    {
        let mut stores: HashMap<String, Arc<dyn ContainerStore>> = HashMap::new();
        let mut clients: HashMap<String, Arc<dyn LogSource>> = HashMap::new();

        for host in hosts {
            let name = host.host().to_string();
            stores.insert(name.clone(), host.clone());
            clients.insert(name, host);
        }

        Self {
            stores: Arc::new(stores),
            clients: Arc::new(clients),
            settings: StreamSettings::default(),
            membership_buffer: MEMBERSHIP_BUFFER,
            shutdown,
        }
    }

    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_membership_buffer(mut self, membership_buffer: usize) -> Self {
        self.membership_buffer = membership_buffer.max(1);
        self
    }

    fn host(&self, host: &str) -> Result<(&Arc<dyn ContainerStore>, &Arc<dyn LogSource>), ApiError> {
        match (self.stores.get(host), self.clients.get(host)) {
            (Some(store), Some(client)) => Ok((store, client)),
            _ => Err(ApiError::UnknownHost(host.to_string())),
        }
    }

    async fn find_container(&self, host: &str, id: &str) -> Result<Container, ApiError> {
        let (store, _) = self.host(host)?;
        store
            .find_container(id)
            .await
            .map_err(|e| ApiError::from_lookup(id, e))
    }

    /// Start a multiplexed stream and hand back its response.
    ///
    /// `seed` is queued before discovery starts, so the membership channel
    /// holds at least that many containers.
    fn stream(
        &self,
        query: &LogQuery,
        membership: Membership,
        seed: Vec<Container>,
        buffer: usize,
    ) -> Result<Response, ApiError> {
        let std_types = query.std_types()?;
        let cancel = self.shutdown.child_token();

        let (body_tx, body_rx) = mpsc::channel(1);
        let multiplexer = StreamMultiplexer::new(
            self.clients.clone(),
            std_types,
            ChannelSink::new(body_tx),
            cancel.clone(),
            self.settings.clone(),
        )?;

        let (members_tx, members_rx) = mpsc::channel(buffer.max(seed.len()).max(1));
        for container in seed {
            if members_tx.try_send(container).is_err() {
                debug!("membership channel full while seeding");
                break;
            }
        }

        let span = info_span!("log_stream", membership = ?membership);
        let stores = self.stores.values().cloned().collect();
        MembershipFilter::new(stores, membership).spawn(members_tx, cancel.clone());
        tokio::spawn(multiplexer.run(members_rx).instrument(span));

        Ok((event_stream_headers(), channel_body(body_rx, cancel)).into_response())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/hosts/{host}/containers/{id}/logs/stream",
            get(stream_container_logs),
        )
        .route("/api/hosts/{host}/logs/stream", get(stream_logs_merged))
        .route("/api/services/{service}/logs/stream", get(stream_service_logs))
        .route("/api/stacks/{stack}/logs/stream", get(stream_stack_logs))
        .route("/api/groups/{group}/logs/stream", get(stream_group_logs))
        .route(
            "/api/hosts/{host}/containers/{id}/logs",
            get(fetch_logs_between_dates),
        )
        .route(
            "/api/hosts/{host}/containers/{id}/logs/download",
            get(download_logs),
        )
        .with_state(state)
}

/// One container, picked up again when it restarts
async fn stream_container_logs(
    State(state): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    query.std_types()?;

    let container = state.find_container(&host, &id).await?;
    state.stream(&query, Membership::Container(container.id.clone()), vec![container], 1)
}

/// Fixed set of containers on one host
async fn stream_logs_merged(
    State(state): State<AppState>,
    Path(host): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    if query.ids.is_empty() {
        return Err(ApiError::MissingIds);
    }
    query.std_types()?;

    let mut containers = Vec::with_capacity(query.ids.len());
    for id in &query.ids {
        containers.push(state.find_container(&host, id).await?);
    }

    let ids: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
    let buffer = containers.len();
    state.stream(&query, Membership::Containers(ids), containers, buffer)
}

async fn stream_service_logs(
    State(state): State<AppState>,
    Path(service): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    state.stream(&query, Membership::Service(service), Vec::new(), state.membership_buffer)
}

async fn stream_stack_logs(
    State(state): State<AppState>,
    Path(stack): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    state.stream(&query, Membership::Stack(stack), Vec::new(), state.membership_buffer)
}

async fn stream_group_logs(
    State(state): State<AppState>,
    Path(group): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    state.stream(&query, Membership::Group(group), Vec::new(), state.membership_buffer)
}

/// Parsed log lines between `from` and `to`, one JSON document per line
async fn fetch_logs_between_dates(
    State(state): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    let std_types = query.std_types()?;

    let container = state.find_container(&host, &id).await?;
    let (_, client) = state.host(&host)?;
    let frames = client
        .container_logs_between_dates(&container.id, query.from_date(), query.to_date(), std_types)
        .await?;

    let cancel = state.shutdown.child_token();
    let frames = frames.take_until(cancel.clone().cancelled_owned()).boxed();
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(export::write_json_lines(container.id, frames, tx));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-jsonl; charset=UTF-8"),
    );
    Ok((headers, channel_body(rx, cancel)).into_response())
}

/// Full raw output of a container as a gzip file
async fn download_logs(
    State(state): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query = LogQuery::parse(raw.as_deref());
    let std_types = query.std_types()?;

    let container = state.find_container(&host, &id).await?;
    let (_, client) = state.host(&host)?;

    let now = Utc::now();
    let file_name = export::download_file_name(&container.name, now);
    let frames = client
        .container_logs_between_dates(&container.id, DateTime::UNIX_EPOCH, now, std_types)
        .await?;

    let cancel = state.shutdown.child_token();
    let frames = frames.take_until(cancel.clone().cancelled_owned()).boxed();
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(export::write_gzip(file_name.clone(), now, frames, tx));

    let accepts_gzip = request_headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));

    let mut headers = HeaderMap::new();
    let disposition = if accepts_gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/text"));
        format!("attachment; filename={}", file_name)
    } else {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/gzip"));
        format!("attachment; filename={}.gz", file_name)
    };
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }

    Ok((headers, channel_body(rx, cancel)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use dockscope_docker::{InMemoryHost, LogEnd, LogFrame};
    use dockscope_types::{RUNNING, STACK_LABEL};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;
    use tower::ServiceExt;

    fn setup() -> (Arc<InMemoryHost>, CancellationToken, Router) {
        let host = Arc::new(InMemoryHost::new("local"));
        host.add_container(Container::new("c1", "web", "local").with_state(RUNNING));
        host.set_logs(
            "c1",
            vec![LogFrame::stdout("a\n"), LogFrame::stdout("b\n")],
            LogEnd::Hold,
        );

        let shutdown = CancellationToken::new();
        let state = AppState::new(vec![host.clone()], shutdown.clone());
        (host, shutdown, router(state))
    }

    async fn get_uri(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn next_frame(body: &mut axum::body::BodyDataStream) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_stream_requires_std_type() {
        let (_, _, app) = setup();
        let resp = get_uri(app, "/api/hosts/local/containers/c1/logs/stream").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_label_stream_requires_std_type() {
        let (_, _, app) = setup();
        let resp = get_uri(app, "/api/stacks/shop/logs/stream").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_host_and_container() {
        let (_, _, app) = setup();
        let resp = get_uri(app.clone(), "/api/hosts/remote/containers/c1/logs/stream?stdout").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = get_uri(app, "/api/hosts/local/containers/nope/logs/stream?stdout").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_merged_stream_requires_ids() {
        let (_, _, app) = setup();
        let resp = get_uri(app.clone(), "/api/hosts/local/logs/stream?stdout").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = get_uri(app, "/api/hosts/local/logs/stream?stdout&id=c1&id=missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_container_stream() {
        let (_, _, app) = setup();
        let resp = get_uri(app, "/api/hosts/local/containers/c1/logs/stream?stdout").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");

        let mut body = resp.into_body().into_data_stream();
        assert!(next_frame(&mut body).await.contains("\"m\":\"a\""));
        assert!(next_frame(&mut body).await.contains("\"m\":\"b\""));
    }

    #[tokio::test]
    async fn test_merged_stream() {
        let (host, _, app) = setup();
        host.add_container(Container::new("c2", "db", "local"));
        host.set_logs("c2", vec![LogFrame::stderr("ready\n")], LogEnd::Hold);

        let resp = get_uri(app, "/api/hosts/local/logs/stream?stderr&id=c2&id=c1").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let mut body = resp.into_body().into_data_stream();
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("\"c\":\"c2\""));
        assert!(frame.contains("\"s\":\"stderr\""));
    }

    #[tokio::test]
    async fn test_stack_stream() {
        let (host, _, app) = setup();
        host.add_container(
            Container::new("c3", "api", "local")
                .with_labels(HashMap::from([(STACK_LABEL.to_string(), "shop".to_string())]))
                .with_state(RUNNING),
        );
        host.set_logs("c3", vec![LogFrame::stdout("listening\n")], LogEnd::Hold);

        let resp = get_uri(app, "/api/stacks/shop/logs/stream?stdout&stderr").await;
        let mut body = resp.into_body().into_data_stream();
        assert!(next_frame(&mut body).await.contains("\"m\":\"listening\""));
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_streams() {
        let (_, shutdown, app) = setup();
        let resp = get_uri(app, "/api/hosts/local/containers/c1/logs/stream?stdout").await;
        let mut body = resp.into_body().into_data_stream();
        next_frame(&mut body).await;
        next_frame(&mut body).await;

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), body.next()).await;
        assert!(matches!(end, Ok(None)));
    }

    #[tokio::test]
    async fn test_malformed_dates_proceed() {
        let (_, _, app) = setup();
        let resp = get_uri(app, "/api/hosts/local/containers/c1/logs?stdout&from=nope&to=never").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-jsonl; charset=UTF-8");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["m"], "a");
        assert_eq!(lines[1]["c"], "c1");
    }

    #[tokio::test]
    async fn test_download_as_gzip_file() {
        let (_, _, app) = setup();
        let resp = get_uri(app, "/api/hosts/local/containers/c1/logs/download?stdout").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/gzip");
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
        let disposition = resp.headers()[CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=web-"));
        assert!(disposition.ends_with(".log.gz"));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let mut text = String::new();
        GzDecoder::new(body.as_ref()).read_to_string(&mut text).unwrap();
        assert_eq!(text, "a\nb\n");
    }

    #[tokio::test]
    async fn test_download_with_gzip_encoding() {
        let (_, _, app) = setup();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/hosts/local/containers/c1/logs/download?stdout")
                    .header(ACCEPT_ENCODING, "gzip, deflate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/text");
        let disposition = resp.headers()[CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.ends_with(".log"));
    }
}
