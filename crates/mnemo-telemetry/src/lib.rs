//! Pluggable metrics sink and ambient JSON logging.
//!
//! The sink is a process-wide replaceable slot (`OnceLock<RwLock<Arc<dyn
//! MetricsSink>>>`) defaulting to a null sink, so `record()` is always safe
//! to call and becomes a no-op until a sink is installed via [`set_sink`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Errors produced while configuring telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Logging was already initialized in this process.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// The fixed enumeration of event types a [`MetricsSink`] may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A chain directory was initialized.
    ChainInit,
    /// An entry was appended to a chain.
    EntryAdd,
    /// A chain verification pass ran.
    ChainVerify,
    /// A content blob was read from the CAS.
    ContentRead,
    /// A content blob was written to the CAS.
    ContentWrite,
    /// A retrieval query ran against the index.
    RetrievalQuery,
    /// The index was rebuilt from the chain.
    IndexRebuild,
    /// An external anchor was submitted.
    AnchorSubmit,
    /// An external anchor was verified.
    AnchorVerify,
}

/// One telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The event's type tag.
    pub event_type: EventType,
    /// Milliseconds since the Unix epoch when the event was recorded.
    pub ts_millis: i64,
    /// Optional duration of the operation, in milliseconds.
    pub duration_ms: Option<u64>,
    /// Opaque key/value data bag (string values only, to stay serializable
    /// and cheap to aggregate).
    pub data: HashMap<String, String>,
}

impl Event {
    /// Construct an event stamped with the current time.
    pub fn now(event_type: EventType, duration_ms: Option<u64>, data: HashMap<String, String>) -> Self {
        let ts_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self { event_type, ts_millis, duration_ms, data }
    }
}

/// A pluggable metrics collector. Implementations must be cheap and
/// non-blocking on the hot path; `record` is called synchronously from the
/// operation being measured.
pub trait MetricsSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: Event);
}

/// A sink that discards every event. The default when no collector has
/// been installed, so `record()` costs a slot read and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _event: Event) {}
}

/// Per-event-type aggregate counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TypeSummary {
    /// Number of events of this type seen (including ones evicted from the
    /// ring buffer).
    pub count: u64,
    /// Running total of `duration_ms` across all events of this type that
    /// carried a duration.
    total_duration_ms: u64,
    /// Number of events of this type that carried a duration (the
    /// denominator for [`TypeSummary::average_duration_ms`]).
    timed_count: u64,
}

impl TypeSummary {
    /// Mean duration in milliseconds across timed events of this type, or
    /// `None` if none carried a duration.
    pub fn average_duration_ms(&self) -> Option<f64> {
        if self.timed_count == 0 {
            None
        } else {
            Some(self.total_duration_ms as f64 / self.timed_count as f64)
        }
    }
}

/// A bounded in-process ring buffer of recent events, plus running
/// per-type summaries that survive eviction.
pub struct RingBufferSink {
    max_events: usize,
    inner: RwLock<RingInner>,
}

#[derive(Default)]
struct RingInner {
    events: std::collections::VecDeque<Event>,
    summaries: HashMap<EventType, TypeSummary>,
}

impl RingBufferSink {
    /// Create a ring buffer that retains at most `max_events` events.
    pub fn new(max_events: usize) -> Self {
        Self { max_events, inner: RwLock::new(RingInner::default()) }
    }

    /// A snapshot of currently retained events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.inner.read().expect("ring buffer lock poisoned").events.iter().cloned().collect()
    }

    /// A snapshot of per-type summaries.
    pub fn summaries(&self) -> HashMap<EventType, TypeSummary> {
        self.inner.read().expect("ring buffer lock poisoned").summaries.clone()
    }
}

impl MetricsSink for RingBufferSink {
    fn record(&self, event: Event) {
        let mut inner = self.inner.write().expect("ring buffer lock poisoned");
        let summary = inner.summaries.entry(event.event_type).or_default();
        summary.count += 1;
        if let Some(d) = event.duration_ms {
            summary.total_duration_ms += d;
            summary.timed_count += 1;
        }
        inner.events.push_back(event);
        if inner.events.len() > self.max_events {
            inner.events.pop_front();
        }
    }
}

static SINK: OnceLock<RwLock<Arc<dyn MetricsSink>>> = OnceLock::new();

fn slot() -> &'static RwLock<Arc<dyn MetricsSink>> {
    SINK.get_or_init(|| RwLock::new(Arc::new(NullSink)))
}

/// Install `sink` as the process-wide metrics collector, replacing any
/// previously installed sink.
pub fn set_sink(sink: Arc<dyn MetricsSink>) {
    *slot().write().expect("metrics slot lock poisoned") = sink;
}

/// Remove any installed sink, reverting to [`NullSink`].
pub fn clear_sink() {
    set_sink(Arc::new(NullSink));
}

/// Record `event` against whichever sink is currently installed (a no-op,
/// aside from a slot read, when none is).
pub fn record(event: Event) {
    slot().read().expect("metrics slot lock poisoned").record(event);
}

/// Configure a JSON `tracing-subscriber` reading its filter from `RUST_LOG`
/// (defaulting to `"info"`). The engine never calls this itself — the host
/// process opts in. Fails with [`TelemetryError::AlreadyInitialized`] if a
/// global subscriber is already installed (e.g. a second call in the same
/// process, or a host that installed its own).
pub fn init_logging() -> Result<(), TelemetryError> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventType, duration_ms: Option<u64>) -> Event {
        Event { event_type: kind, ts_millis: 0, duration_ms, data: HashMap::new() }
    }

    #[test]
    fn null_sink_accepts_and_discards() {
        let sink = NullSink;
        sink.record(event(EventType::ChainInit, Some(5)));
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let sink = RingBufferSink::new(2);
        sink.record(event(EventType::EntryAdd, None));
        sink.record(event(EventType::EntryAdd, None));
        sink.record(event(EventType::EntryAdd, None));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.summaries()[&EventType::EntryAdd].count, 3);
    }

    #[test]
    fn ring_buffer_average_duration() {
        let sink = RingBufferSink::new(10);
        sink.record(event(EventType::ChainVerify, Some(10)));
        sink.record(event(EventType::ChainVerify, Some(30)));
        sink.record(event(EventType::ChainVerify, None));
        let summaries = sink.summaries();
        let summary = summaries[&EventType::ChainVerify];
        assert_eq!(summary.count, 3);
        assert_eq!(summary.average_duration_ms(), Some(20.0));
    }

    #[test]
    fn global_slot_defaults_to_null_then_accepts_install() {
        clear_sink();
        record(event(EventType::ContentRead, None));

        let ring = Arc::new(RingBufferSink::new(10));
        set_sink(ring.clone());
        record(event(EventType::ContentWrite, Some(3)));
        assert_eq!(ring.summaries()[&EventType::ContentWrite].count, 1);

        clear_sink();
    }
}
