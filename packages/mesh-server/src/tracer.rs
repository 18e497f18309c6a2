//! Distributed tracer: trace and span records in memory.
//!
//! A trace is identified by the root span created when it started. Trace-level
//! operations (`end_trace`, `add_tag`, `add_log`, `set_baggage`) act on that
//! root span. Retention is bounded; the oldest trace is evicted together with
//! all of its spans.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use meshkit_core::{ClockSource, LogEntry, LogLevel, Span, SpanStatus};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
struct TraceRecord {
    root_span_id: String,
    span_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct TraceStore {
    traces: HashMap<String, TraceRecord>,
    spans: HashMap<String, Span>,
    /// Trace ids, oldest first.
    order: VecDeque<String>,
}

impl TraceStore {
    fn root_mut(&mut self, trace_id: &str) -> Option<&mut Span> {
        let root = &self.traces.get(trace_id)?.root_span_id;
        self.spans.get_mut(root)
    }

    fn open_root_mut(&mut self, trace_id: &str) -> Option<&mut Span> {
        self.root_mut(trace_id).filter(|s| s.is_open())
    }

    fn evict_to(&mut self, max_traces: usize) {
        while self.traces.len() > max_traces {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(record) = self.traces.remove(&oldest) {
                for span_id in &record.span_ids {
                    self.spans.remove(span_id);
                }
                debug!(trace_id = %oldest, spans = record.span_ids.len(), "trace evicted");
            }
        }
    }
}

/// In-memory trace and span store.
pub struct Tracer {
    store: Mutex<TraceStore>,
    clock: Arc<dyn ClockSource>,
    max_traces: usize,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Tracer {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, max_traces: usize) -> Self {
        Self {
            store: Mutex::new(TraceStore::default()),
            clock,
            max_traces: max_traces.max(1),
        }
    }

    fn span(
        &self,
        trace_id: String,
        parent_span_id: Option<String>,
        operation: &str,
        service: &str,
        inherited: BTreeMap<String, String>,
    ) -> Span {
        Span {
            trace_id,
            span_id: new_id(),
            parent_span_id,
            operation_name: operation.to_string(),
            service_name: service.to_string(),
            start_time: self.clock.now(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Started,
            tags: inherited.clone(),
            logs: Vec::new(),
            baggage: inherited,
        }
    }

    /// Starts a trace and its root span.
    ///
    /// With a known `parent_span_id` the span joins the parent's trace and
    /// inherits its baggage; the trace's root record is left unchanged. An
    /// unknown parent id starts a new trace that remembers the id.
    pub fn start_trace(&self, operation: &str, service: &str, parent_span_id: Option<&str>) -> Span {
        let mut store = self.store.lock();
        let parent = parent_span_id.and_then(|id| store.spans.get(id));

        let Some(parent) = parent else {
            let span = self.span(
                new_id(),
                parent_span_id.map(str::to_string),
                operation,
                service,
                BTreeMap::new(),
            );
            store.traces.insert(
                span.trace_id.clone(),
                TraceRecord {
                    root_span_id: span.span_id.clone(),
                    span_ids: vec![span.span_id.clone()],
                },
            );
            store.order.push_back(span.trace_id.clone());
            store.spans.insert(span.span_id.clone(), span.clone());
            store.evict_to(self.max_traces);
            return span;
        };

        let span = self.span(
            parent.trace_id.clone(),
            Some(parent.span_id.clone()),
            operation,
            service,
            parent.baggage.clone(),
        );
        if let Some(record) = store.traces.get_mut(&span.trace_id) {
            record.span_ids.push(span.span_id.clone());
        }
        store.spans.insert(span.span_id.clone(), span.clone());
        span
    }

    /// Adds a child span to an existing trace.
    ///
    /// The parent is `parent_span_id` when it names a span of this trace,
    /// else the trace's root. The child copies the parent's baggage, as it is
    /// now, into both its tags and its baggage. Returns `None` for an unknown
    /// trace.
    pub fn add_span(
        &self,
        trace_id: &str,
        operation: &str,
        service: &str,
        parent_span_id: Option<&str>,
    ) -> Option<Span> {
        let mut store = self.store.lock();
        let record = store.traces.get(trace_id)?;
        let parent_id = parent_span_id
            .filter(|id| record.span_ids.iter().any(|s| s == id))
            .unwrap_or(record.root_span_id.as_str())
            .to_string();
        let baggage = store
            .spans
            .get(&parent_id)
            .map(|p| p.baggage.clone())
            .unwrap_or_default();

        let span = self.span(trace_id.to_string(), Some(parent_id), operation, service, baggage);
        if let Some(record) = store.traces.get_mut(trace_id) {
            record.span_ids.push(span.span_id.clone());
        }
        store.spans.insert(span.span_id.clone(), span.clone());
        Some(span)
    }

    /// Ends a trace's root span. `false` if unknown or already ended.
    pub fn end_trace(&self, trace_id: &str, status: SpanStatus) -> bool {
        let now = self.clock.now();
        let mut store = self.store.lock();
        match store.open_root_mut(trace_id) {
            Some(root) => {
                root.finish(status, now);
                true
            }
            None => false,
        }
    }

    /// Ends a span. `false` if unknown or already ended.
    pub fn end_span(&self, span_id: &str, status: SpanStatus) -> bool {
        let now = self.clock.now();
        let mut store = self.store.lock();
        match store.spans.get_mut(span_id).filter(|s| s.is_open()) {
            Some(span) => {
                span.finish(status, now);
                true
            }
            None => false,
        }
    }

    pub fn add_tag(&self, trace_id: &str, key: &str, value: &str) -> bool {
        let mut store = self.store.lock();
        store
            .open_root_mut(trace_id)
            .map(|root| root.tags.insert(key.to_string(), value.to_string()))
            .is_some()
    }

    pub fn add_log(&self, trace_id: &str, level: LogLevel, message: &str) -> bool {
        let timestamp = self.clock.now();
        let mut store = self.store.lock();
        store
            .open_root_mut(trace_id)
            .map(|root| {
                root.logs.push(LogEntry {
                    timestamp,
                    level,
                    message: message.to_string(),
                });
            })
            .is_some()
    }

    /// Sets baggage on the trace's root. Spans created afterwards inherit it;
    /// existing spans keep the snapshot taken at their creation.
    pub fn set_baggage(&self, trace_id: &str, key: &str, value: &str) -> bool {
        let mut store = self.store.lock();
        store
            .open_root_mut(trace_id)
            .map(|root| root.baggage.insert(key.to_string(), value.to_string()))
            .is_some()
    }

    pub fn tag_span(&self, span_id: &str, key: &str, value: &str) -> bool {
        let mut store = self.store.lock();
        store
            .spans
            .get_mut(span_id)
            .filter(|s| s.is_open())
            .map(|s| s.tags.insert(key.to_string(), value.to_string()))
            .is_some()
    }

    pub fn log_span(&self, span_id: &str, level: LogLevel, message: &str) -> bool {
        let timestamp = self.clock.now();
        let mut store = self.store.lock();
        store
            .spans
            .get_mut(span_id)
            .filter(|s| s.is_open())
            .map(|s| {
                s.logs.push(LogEntry {
                    timestamp,
                    level,
                    message: message.to_string(),
                });
            })
            .is_some()
    }

    /// The root span of a trace.
    #[must_use]
    pub fn get_trace(&self, trace_id: &str) -> Option<Span> {
        let store = self.store.lock();
        let record = store.traces.get(trace_id)?;
        store.spans.get(&record.root_span_id).cloned()
    }

    #[must_use]
    pub fn get_span(&self, span_id: &str) -> Option<Span> {
        self.store.lock().spans.get(span_id).cloned()
    }

    /// Every span of a trace in creation order.
    #[must_use]
    pub fn trace_spans(&self, trace_id: &str) -> Vec<Span> {
        let store = self.store.lock();
        store
            .traces
            .get(trace_id)
            .map(|record| {
                record
                    .span_ids
                    .iter()
                    .filter_map(|id| store.spans.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Root spans of traces started by `service`.
    #[must_use]
    pub fn by_service(&self, service: &str) -> Vec<Span> {
        let store = self.store.lock();
        store
            .order
            .iter()
            .filter_map(|id| store.traces.get(id))
            .filter_map(|record| store.spans.get(&record.root_span_id))
            .filter(|root| root.service_name == service)
            .cloned()
            .collect()
    }

    /// The `limit` most recently started traces, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Span> {
        let store = self.store.lock();
        let mut roots: Vec<Span> = store
            .order
            .iter()
            .rev()
            .filter_map(|id| store.traces.get(id))
            .filter_map(|record| store.spans.get(&record.root_span_id).cloned())
            .collect();
        roots.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        roots.truncate(limit);
        roots
    }

    /// Number of retained traces.
    #[must_use]
    pub fn trace_count(&self) -> usize {
        self.store.lock().traces.len()
    }
}
