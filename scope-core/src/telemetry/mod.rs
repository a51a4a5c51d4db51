//! Telemetry primitives for relay calls.
//! Nothing is emitted unless a sink is handed to the relay.

pub mod keys;
pub mod types;

pub use keys::*;
pub use types::*;

use std::sync::{Arc, Mutex};

/// Implement this to receive telemetry events.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread, including from a `Drop`
///   impl when a client disconnects; implementations should avoid panicking.
/// - Keep overhead minimal; this may be on hot paths.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: RelayTrace);
}

/// Sink that keeps every record in memory. Handy for tests and debugging endpoints.
#[derive(Debug, Default)]
pub struct MemorySink {
    traces: Mutex<Vec<RelayTrace>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn traces(&self) -> Vec<RelayTrace> {
        self.traces.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, trace: RelayTrace) {
        if let Ok(mut t) = self.traces.lock() {
            t.push(trace);
        }
    }
}

/// Sink that forwards each record to `tracing` as one event whose fields are
/// named by [`keys`]. Failed relays are logged at warn, the rest at info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

macro_rules! relay_event {
    ($level:expr, $t:expr) => {
        tracing::event!(
            target: "scope::relay",
            $level,
            llm.model = %$t.model,
            upstream.status = $t.upstream_status,
            upstream.req_id = $t.upstream_request_id.as_deref(),
            latency.first_byte_ms = $t.first_byte_ms,
            latency.total_ms = $t.duration_ms,
            stream.bytes = $t.bytes,
            stream.outcome = $t.outcome.as_str(),
            error.kind = $t.error_kind.as_deref(),
            "relay finished"
        )
    };
}

impl TelemetrySink for LogSink {
    fn record(&self, trace: RelayTrace) {
        if trace.outcome == RelayOutcome::Failed {
            relay_event!(tracing::Level::WARN, trace);
        } else {
            relay_event!(tracing::Level::INFO, trace);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_capture;
