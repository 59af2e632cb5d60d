//! Shared types for dockscope
//!
//! This crate contains data structures used across multiple dockscope crates.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

// ============================================================================
// Docker Resource Types
// ============================================================================

/// Label carrying the swarm service name
pub const SERVICE_LABEL: &str = "com.docker.swarm.service.name";

/// Label carrying the swarm stack namespace
pub const STACK_LABEL: &str = "com.docker.stack.namespace";

/// Label carrying the logical group a container is shown under
pub const GROUP_LABEL: &str = "dev.dockscope.group";

/// Container state reported by the engine for live containers
pub const RUNNING: &str = "running";

/// Snapshot of a container as reported by the source resolver
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,

    /// Identifier of the host the container runs on
    pub host: String,

    pub labels: HashMap<String, String>,

    /// Logical group (from [`GROUP_LABEL`])
    pub group: Option<String>,

    /// Engine state, e.g. `running` or `exited`
    pub state: String,

    /// When the current run started, if it ever did
    pub started_at: Option<DateTime<Utc>>,

    /// Whether the container was started with a TTY
    pub tty: bool,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            ..Default::default()
        }
    }

    /// Attach labels, deriving the logical group from them
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.group = labels.get(GROUP_LABEL).cloned();
        self.labels = labels;
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == RUNNING
    }

    /// Swarm service name, if any
    pub fn service(&self) -> Option<&str> {
        self.labels.get(SERVICE_LABEL).map(String::as_str)
    }

    /// Swarm stack namespace, if any
    pub fn stack(&self) -> Option<&str> {
        self.labels.get(STACK_LABEL).map(String::as_str)
    }
}

bitflags! {
    /// Output streams selected for a log request
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StdType: u8 {
        const STDOUT = 0b01;
        const STDERR = 0b10;
    }
}

impl StdType {
    /// Build from `stdout` / `stderr` presence flags
    pub fn from_flags(stdout: bool, stderr: bool) -> Self {
        let mut std_types = Self::empty();
        std_types.set(Self::STDOUT, stdout);
        std_types.set(Self::STDERR, stderr);
        std_types
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Map numeric levels (pino / bunyan style)
    pub fn from_number(n: u64) -> Self {
        match n {
            0..=10 => Self::Trace,
            11..=20 => Self::Debug,
            21..=30 => Self::Info,
            31..=40 => Self::Warn,
            41..=50 => Self::Error,
            _ => Self::Fatal,
        }
    }
}

/// Which output stream a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    #[default]
    Unknown,
}

/// A single log line in transit through the merge pipeline
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEvent {
    /// Plain text, or the parsed object for JSON lines
    #[serde(rename = "m")]
    pub message: serde_json::Value,

    /// Unix nanoseconds, 0 when unknown
    #[serde(rename = "ts")]
    pub timestamp: i64,

    #[serde(rename = "l")]
    pub level: LogLevel,

    #[serde(rename = "s")]
    pub stream: StreamKind,

    #[serde(rename = "c")]
    pub container_id: String,
}

impl LogEvent {
    /// Create a plain text event with no timestamp
    pub fn new(container_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: serde_json::Value::String(message.into()),
            timestamp: 0,
            level: LogLevel::Unknown,
            stream: StreamKind::Unknown,
            container_id: container_id.into(),
        }
    }

    /// Text content of the message, if it is plain text
    pub fn text(&self) -> Option<&str> {
        self.message.as_str()
    }
}

// ============================================================================
// Lifecycle Types
// ============================================================================

/// Kind of lifecycle transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ContainerEventKind {
    #[serde(rename = "container-started")]
    Started,
    #[serde(rename = "container-stopped")]
    Stopped,
}

/// Synthesized lifecycle signal for a container
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEvent {
    pub actor_id: String,
    pub name: ContainerEventKind,
    pub host: String,
}

impl ContainerEvent {
    pub fn started(container: &Container) -> Self {
        Self::new(container, ContainerEventKind::Started)
    }

    pub fn stopped(container: &Container) -> Self {
        Self::new(container, ContainerEventKind::Stopped)
    }

    fn new(container: &Container, name: ContainerEventKind) -> Self {
        Self {
            actor_id: container.id.clone(),
            name,
            host: container.host.clone(),
        }
    }
}
