//! Finite log exports: JSON lines between two dates and gzip downloads.

use std::io::{self, Write};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::{Compression, GzBuilder};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use dockscope_docker::LogStream;
use dockscope_logs::{EventGenerator, LogEvent};

/// Comment stored in the gzip member header
pub const GZIP_COMMENT: &str = "Logs generated by dockscope";

/// `<name>-<YYYY-MM-DDTHH-MM-SS>.log`
pub fn download_file_name(container_name: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}.log", container_name, now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Write one JSON document per log line into `tx`
pub async fn write_json_lines(container_id: String, mut frames: LogStream, tx: mpsc::Sender<Bytes>) {
    let mut generator = EventGenerator::new(container_id);

    loop {
        let events = match frames.next().await {
            Some(Ok(frame)) => generator.push(&frame),
            Some(Err(e)) => {
                debug!("log export interrupted: {}", e);
                break;
            }
            None => break,
        };

        if !send_json_lines(&tx, events).await {
            return;
        }
    }

    send_json_lines(&tx, generator.finish()).await;
}

async fn send_json_lines(tx: &mpsc::Sender<Bytes>, events: Vec<LogEvent>) -> bool {
    for event in events {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("json encoding error while exporting logs: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if tx.send(Bytes::from(line)).await.is_err() {
            return false;
        }
    }
    true
}

/// Compress the raw log output into `tx` as it is read
pub async fn write_gzip(file_name: String, now: DateTime<Utc>, frames: LogStream, tx: mpsc::Sender<Bytes>) {
    if let Err(e) = compress(file_name, now, frames, &tx).await {
        debug!("log download stopped: {}", e);
    }
}

async fn compress(
    file_name: String,
    now: DateTime<Utc>,
    mut frames: LogStream,
    tx: &mpsc::Sender<Bytes>,
) -> io::Result<()> {
    let mtime = u32::try_from(now.timestamp()).unwrap_or_default();
    let mut encoder = GzBuilder::new()
        .filename(file_name)
        .comment(GZIP_COMMENT)
        .mtime(mtime)
        .write(Vec::new(), Compression::default());

    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(io::Error::other)?;
        encoder.write_all(&frame.bytes)?;

        let chunk = std::mem::take(encoder.get_mut());
        if !chunk.is_empty() {
            send(tx, chunk).await?;
        }
    }

    let rest = encoder.finish()?;
    send(tx, rest).await
}

async fn send(tx: &mpsc::Sender<Bytes>, chunk: Vec<u8>) -> io::Result<()> {
    tx.send(Bytes::from(chunk))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
}
