use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use dockscope_docker::LogFrame;
use dockscope_types::{LogEvent, LogLevel, StdType, StreamKind};

/// Turns demultiplexed log frames of one container into structured events
pub struct EventGenerator {
    container_id: String,

    /// Unterminated tail of the stdout stream
    stdout: Vec<u8>,

    /// Unterminated tail of the stderr stream
    stderr: Vec<u8>,
}

impl EventGenerator {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Feed one frame, returning every line it completed, in order
    pub fn push(&mut self, frame: &LogFrame) -> Vec<LogEvent> {
        let kind = stream_kind(frame.stream);
        let buffer = match kind {
            StreamKind::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        };
        buffer.extend_from_slice(&frame.bytes);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }

        lines
            .iter()
            .map(|line| LogParser::parse(&String::from_utf8_lossy(line), &self.container_id, kind))
            .collect()
    }

    /// Flush unterminated output once the stream has ended
    pub fn finish(&mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        for (buffer, kind) in [
            (&mut self.stdout, StreamKind::Stdout),
            (&mut self.stderr, StreamKind::Stderr),
        ] {
            if !buffer.is_empty() {
                let line = std::mem::take(buffer);
                events.push(LogParser::parse(
                    &String::from_utf8_lossy(&line),
                    &self.container_id,
                    kind,
                ));
            }
        }
        events
    }
}

fn stream_kind(stream: StdType) -> StreamKind {
    if stream == StdType::STDERR {
        StreamKind::Stderr
    } else if stream == StdType::STDOUT {
        StreamKind::Stdout
    } else {
        StreamKind::Unknown
    }
}

/// Log parser for extracting structure from raw log lines
pub struct LogParser;

impl LogParser {
    /// Parse a raw log line into a LogEvent
    pub fn parse(raw: &str, container_id: &str, stream: StreamKind) -> LogEvent {
        // Docker prefixes lines with an RFC 3339 timestamp when asked to
        let (timestamp, content) = Self::extract_docker_timestamp(raw);

        let mut event = LogEvent::new(container_id, content);
        event.stream = stream;
        event.timestamp = timestamp
            .and_then(|ts| ts.timestamp_nanos_opt())
            .unwrap_or(0);

        if let Some((fields, level)) = Self::try_parse_json(content) {
            event.message = Value::Object(fields);
            event.level = level;
        } else {
            event.level = Self::extract_level_from_text(content);
        }

        event
    }

    /// Extract the engine timestamp from the beginning of a log line
    fn extract_docker_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // 2024-01-15T10:30:00.123456789Z (30 chars), or 2024-01-15T10:30:00Z (20 chars)
        if raw.len() >= 20 {
            let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
            if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
                let ts_str = &raw[..=z_pos];
                if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
                    let rest = &raw[z_pos + 1..];
                    let content = rest.strip_prefix(' ').unwrap_or(rest);
                    return (Some(ts.with_timezone(&Utc)), content);
                }
            }
        }
        (None, raw)
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }

    /// Try to parse content as a JSON object
    fn try_parse_json(content: &str) -> Option<(Map<String, Value>, LogLevel)> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        let value: Value = serde_json::from_str(trimmed).ok()?;
        let Value::Object(fields) = value else {
            return None;
        };

        let level = Self::extract_level_from_json(&fields);
        Some((fields, level))
    }

    /// Extract log level from JSON fields
    fn extract_level_from_json(fields: &Map<String, Value>) -> LogLevel {
        let level_fields = [
            "level",
            "lvl",
            "severity",
            "log.level",
            "loglevel",
            "log_level",
            "Level",
            "LEVEL",
        ];

        for field in level_fields {
            match fields.get(field) {
                Some(Value::String(s)) => return LogLevel::from_str(s),
                Some(Value::Number(n)) => {
                    if let Some(num) = n.as_u64() {
                        return LogLevel::from_number(num);
                    }
                }
                _ => {}
            }
        }

        LogLevel::Unknown
    }

    /// Extract log level from plain text patterns
    fn extract_level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        // [ERROR], ERROR:, " ERROR " in that order of confidence
        let marked_patterns = [
            ("[FATAL]", LogLevel::Fatal),
            ("[PANIC]", LogLevel::Fatal),
            ("[CRITICAL]", LogLevel::Fatal),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Trace),
            ("FATAL:", LogLevel::Fatal),
            ("PANIC:", LogLevel::Fatal),
            ("ERROR:", LogLevel::Error),
            ("ERR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Trace),
            (" FATAL ", LogLevel::Fatal),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" WARNING ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
            (" TRACE ", LogLevel::Trace),
        ];

        for (pattern, level) in marked_patterns {
            if upper.contains(pattern) {
                return level;
            }
        }

        let start_patterns = [
            ("FATAL", LogLevel::Fatal),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Trace),
        ];

        let trimmed_upper = upper.trim_start();
        for (pattern, level) in start_patterns {
            if trimmed_upper.starts_with(pattern) {
                return level;
            }
        }

        LogLevel::Unknown
    }
}
