//! HTTP surface for dockscope
//!
//! This crate exposes the log streams as Server-Sent Events routes on an
//! axum router, plus JSON lines and gzip exports of finished ranges.

mod body;
mod error;
mod export;
mod query;
mod router;

pub use body::{CancelOnDrop, channel_body, event_stream_headers};
pub use error::ApiError;
pub use export::{GZIP_COMMENT, download_file_name};
pub use query::LogQuery;
pub use router::{AppState, MEMBERSHIP_BUFFER, router};
