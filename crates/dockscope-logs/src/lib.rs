//! Log streaming for dockscope
//!
//! This crate turns container log output into a merged Server-Sent Events
//! stream: line parsing, per-container tailing, membership discovery,
//! lifecycle events and the per-request multiplexer.

mod lifecycle;
mod membership;
mod multiplexer;
mod parser;
mod sse;
mod stream;

pub use lifecycle::{on_member_arrival, on_worker_exit};
pub use membership::{Membership, MembershipFilter};
pub use multiplexer::{KEEPALIVE, StreamError, StreamMultiplexer, StreamSettings};
pub use parser::{EventGenerator, LogParser};
pub use sse::{
    CONTAINER_EVENT, ChannelSink, FrameSink, SinkClosed, encode_container_event, encode_log, ping,
};
pub use stream::{StreamItem, TailOutcome, tail_container};

// Re-export types used in our public API
pub use dockscope_types::{ContainerEvent, LogEvent, LogLevel};
