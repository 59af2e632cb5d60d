//! Server-Sent Events framing for the merged stream.
//!
//! Every frame is handed to a [`FrameSink`] on its own, and the sink pushes
//! it to the client before accepting the next one.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

use dockscope_types::{ContainerEvent, LogEvent};

/// SSE event name carrying lifecycle events
pub const CONTAINER_EVENT: &str = "container-event";

/// The client stopped reading
#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Destination of encoded frames
#[async_trait]
pub trait FrameSink: Send {
    /// Whether each frame reaches the client as soon as it is sent
    fn supports_flush(&self) -> bool {
        true
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), SinkClosed>;
}

/// Sink feeding a channel, read by a streaming response body
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }
}

/// `data: <json>\n`, `id: <timestamp>\n` when known, blank line
pub fn encode_log(event: &LogEvent) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(event)?;

    let mut frame = BytesMut::with_capacity(json.len() + 40);
    frame.put_slice(b"data: ");
    frame.put_slice(&json);
    frame.put_u8(b'\n');
    if event.timestamp > 0 {
        frame.put_slice(format!("id: {}\n", event.timestamp).as_bytes());
    }
    frame.put_u8(b'\n');

    Ok(frame.freeze())
}

/// `event: container-event\ndata: <json>\n\n`
pub fn encode_container_event(event: &ContainerEvent) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Bytes::from(format!("event: {CONTAINER_EVENT}\ndata: {json}\n\n")))
}

/// Comment frame keeping idle connections open
pub fn ping() -> Bytes {
    Bytes::from_static(b":ping \n\n")
}
