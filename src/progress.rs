//! Progress event plumbing (§4.H "Progress events are emitted at each phase
//! transition and on every per-expert state change").
//!
//! A thin observer trait rather than a channel: callers that want a stream
//! can implement it over an `mpsc::Sender`; callers that don't care get
//! [`NoopProgressSink`] for free.

use crate::types::{ExpertStatus, Phase};
pub use crate::types::ProgressEvent;

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Collects every emitted event in order; used by tests and by the demo
/// binary to print a progress trace.
#[derive(Default)]
pub struct RecordingProgressSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn phase_event(phase: Phase, percentage: f64, message: impl Into<String>, elapsed_ms: u64) -> ProgressEvent {
    ProgressEvent {
        phase,
        percentage,
        expert_id: None,
        status: None,
        message: Some(message.into()),
        timestamp_monotonic_ms: elapsed_ms,
    }
}

pub fn expert_event(
    phase: Phase,
    percentage: f64,
    expert_id: impl Into<String>,
    status: ExpertStatus,
    elapsed_ms: u64,
) -> ProgressEvent {
    ProgressEvent {
        phase,
        percentage,
        expert_id: Some(expert_id.into()),
        status: Some(status),
        message: None,
        timestamp_monotonic_ms: elapsed_ms,
    }
}
