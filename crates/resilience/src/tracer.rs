//! Request tracing
//!
//! A trace groups the nested operations performed for one logical request.
//! [`RequestTracer::start_trace`] hands out a [`TraceHandle`]; each
//! [`TraceHandle::span`] call opens a span whose parent is the innermost span
//! still open. Spans are closed through their [`SpanGuard`]:
//!
//! - `succeed()` records `Ok`
//! - `fail(msg)` records `Failed(msg)`
//! - dropping the guard records `Cancelled`, or `Failed("panicked")` while
//!   the thread is unwinding
//!
//! Finishing (or dropping) the handle publishes the trace to the tracer,
//! which keeps the most recent `max_traces` of them for export.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::{Component, MetricsSink, OutcomeEvent};

/// How a span ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum SpanOutcome {
    Ok,
    Failed(String),
    Cancelled,
}

impl SpanOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::Failed(_) => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One span of a trace, in creation order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    /// Index of the span within its trace
    pub span_id: u32,
    pub parent_id: Option<u32>,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// `None` while the span is still open
    pub outcome: Option<SpanOutcome>,
}

/// A finished trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestTrace {
    pub trace_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub spans: Vec<SpanRecord>,
}

impl RequestTrace {
    pub fn failed_spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.spans.iter().filter(|span| matches!(span.outcome, Some(SpanOutcome::Failed(_))))
    }
}

/// Keeps the most recent finished traces.
///
/// Cloning yields another handle to the same trace table.
#[derive(Clone)]
pub struct RequestTracer {
    max_traces: usize,
    traces: Arc<Mutex<VecDeque<RequestTrace>>>,
    sink: Option<Arc<dyn MetricsSink>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RequestTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracer")
            .field("max_traces", &self.max_traces)
            .field("retained", &self.traces.lock().len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl RequestTracer {
    /// Retain at most `max_traces` finished traces.
    pub fn new(max_traces: usize) -> ConfigResult<Self> {
        if max_traces == 0 {
            return Err(ConfigError::invalid("max_traces", "must be greater than 0"));
        }
        Ok(Self {
            max_traces,
            traces: Arc::new(Mutex::new(VecDeque::with_capacity(max_traces))),
            sink: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Mirror every finished span to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn start_trace(&self) -> TraceHandle {
        let trace_id = Uuid::new_v4();
        debug!(%trace_id, "trace started");
        TraceHandle {
            state: Arc::new(Mutex::new(TraceState {
                trace_id,
                started_at: self.clock.utc_now(),
                spans: Vec::new(),
                open: Vec::new(),
                starts: Vec::new(),
                finished: false,
            })),
            tracer: self.clone(),
            published: false,
        }
    }

    /// Ordered spans of a retained trace.
    pub fn export(&self, trace_id: Uuid) -> Option<Vec<SpanRecord>> {
        self.trace(trace_id).map(|trace| trace.spans)
    }

    pub fn trace(&self, trace_id: Uuid) -> Option<RequestTrace> {
        self.traces.lock().iter().find(|trace| trace.trace_id == trace_id).cloned()
    }

    /// Retained traces, oldest first.
    pub fn recent(&self) -> Vec<RequestTrace> {
        self.traces.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, trace: RequestTrace) {
        debug!(trace_id = %trace.trace_id, spans = trace.spans.len(), "trace finished");
        let mut traces = self.traces.lock();
        traces.push_back(trace);
        while traces.len() > self.max_traces {
            traces.pop_front();
        }
    }
}

#[derive(Debug)]
struct TraceState {
    trace_id: Uuid,
    started_at: DateTime<Utc>,
    spans: Vec<SpanRecord>,
    /// Ids of open spans, innermost last
    open: Vec<u32>,
    /// Monotonic start of each span, indexed by span id
    starts: Vec<Instant>,
    finished: bool,
}

/// Owner of one in-progress trace.
pub struct TraceHandle {
    state: Arc<Mutex<TraceState>>,
    tracer: RequestTracer,
    published: bool,
}

impl fmt::Debug for TraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceHandle").field("trace_id", &self.trace_id()).finish()
    }
}

impl TraceHandle {
    pub fn trace_id(&self) -> Uuid {
        self.state.lock().trace_id
    }

    /// Open a span nested under the innermost open span.
    pub fn span(&self, name: impl Into<String>) -> SpanGuard {
        let name = name.into();
        let mut state = self.state.lock();
        let span_id = u32::try_from(state.spans.len()).unwrap_or(u32::MAX);
        let parent_id = state.open.last().copied();
        state.spans.push(SpanRecord {
            span_id,
            parent_id,
            name,
            started_at: self.tracer.clock.utc_now(),
            ended_at: None,
            duration_ms: None,
            outcome: None,
        });
        state.starts.push(self.tracer.clock.now());
        state.open.push(span_id);
        SpanGuard {
            state: Arc::clone(&self.state),
            tracer: self.tracer.clone(),
            span_id,
            settled: false,
        }
    }

    /// Spans recorded so far, including open ones.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.state.lock().spans.clone()
    }

    /// Close the trace and publish it. Spans still open are recorded as
    /// cancelled.
    pub fn finish(mut self) {
        self.publish();
    }

    fn publish(&mut self) {
        if self.published {
            return;
        }
        self.published = true;

        let now = self.tracer.clock.now();
        let finished_at = self.tracer.clock.utc_now();
        let trace = {
            let mut state = self.state.lock();
            state.finished = true;
            let open = std::mem::take(&mut state.open);
            for span_id in open {
                close_locked(&mut state, span_id, SpanOutcome::Cancelled, now, finished_at);
            }
            RequestTrace {
                trace_id: state.trace_id,
                started_at: state.started_at,
                finished_at,
                spans: state.spans.clone(),
            }
        };
        self.tracer.publish(trace);
    }
}

impl Drop for TraceHandle {
    fn drop(&mut self) {
        self.publish();
    }
}

/// RAII guard for an open span.
#[must_use = "dropping the guard immediately records the span as cancelled"]
pub struct SpanGuard {
    state: Arc<Mutex<TraceState>>,
    tracer: RequestTracer,
    span_id: u32,
    settled: bool,
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard").field("span_id", &self.span_id).finish()
    }
}

impl SpanGuard {
    pub fn span_id(&self) -> u32 {
        self.span_id
    }

    pub fn succeed(mut self) {
        self.close(SpanOutcome::Ok);
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.close(SpanOutcome::Failed(message.into()));
    }

    fn close(&mut self, outcome: SpanOutcome) {
        if self.settled {
            return;
        }
        self.settled = true;

        let now = self.tracer.clock.now();
        let ended_at = self.tracer.clock.utc_now();
        let mirrored = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.open.retain(|id| *id != self.span_id);
            close_locked(&mut state, self.span_id, outcome.clone(), now, ended_at)
        };

        if let (Some(sink), Some((name, latency))) = (&self.tracer.sink, mirrored) {
            sink.record(
                OutcomeEvent::new(Component::Tracer, name, outcome.label())
                    .with_latency(latency)
                    .at(ended_at),
            );
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let outcome = if std::thread::panicking() {
            SpanOutcome::Failed("panicked".to_string())
        } else {
            SpanOutcome::Cancelled
        };
        self.close(outcome);
    }
}

/// Record the end of `span_id`; returns its name and duration for mirroring.
fn close_locked(
    state: &mut TraceState,
    span_id: u32,
    outcome: SpanOutcome,
    now: Instant,
    ended_at: DateTime<Utc>,
) -> Option<(String, Duration)> {
    let index = span_id as usize;
    let started = state.starts.get(index).copied()?;
    let span = state.spans.get_mut(index)?;
    if span.outcome.is_some() {
        return None;
    }
    let elapsed = now.saturating_duration_since(started);
    span.ended_at = Some(ended_at);
    span.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    span.outcome = Some(outcome);
    Some((span.name.clone(), elapsed))
}
