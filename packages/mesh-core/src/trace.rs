//! Distributed trace and span records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Started,
    Completed,
    Failed,
}

/// Severity of a span log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One timestamped log line attached to a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

/// A timed segment of a trace. The root span of a trace doubles as the
/// trace record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub service_name: String,
    /// Start time (ms since epoch).
    pub start_time: u64,
    pub end_time: Option<u64>,
    /// `end_time - start_time` once ended (ms).
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    /// Local annotations.
    pub tags: BTreeMap<String, String>,
    pub logs: Vec<LogEntry>,
    /// Context propagated to child spans at creation.
    pub baggage: BTreeMap<String, String>,
}

impl Span {
    /// Whether the span can still be annotated.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == SpanStatus::Started
    }

    /// Stamps end time, duration and terminal status.
    pub fn finish(&mut self, status: SpanStatus, now_ms: u64) {
        self.end_time = Some(now_ms);
        self.duration_ms = Some(now_ms.saturating_sub(self.start_time));
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: u64) -> Span {
        Span {
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            parent_span_id: None,
            operation_name: "GET /x".to_string(),
            service_name: "gateway".to_string(),
            start_time: start,
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Started,
            tags: BTreeMap::new(),
            logs: Vec::new(),
            baggage: BTreeMap::new(),
        }
    }

    #[test]
    fn finish_computes_duration() {
        let mut s = span(1_000);
        assert!(s.is_open());
        s.finish(SpanStatus::Completed, 1_050);
        assert_eq!(s.duration_ms, Some(50));
        assert_eq!(s.end_time, Some(1_050));
        assert!(!s.is_open());
    }

    #[test]
    fn finish_before_start_saturates() {
        let mut s = span(1_000);
        s.finish(SpanStatus::Failed, 900);
        assert_eq!(s.duration_ms, Some(0));
        assert_eq!(s.status, SpanStatus::Failed);
    }
}
