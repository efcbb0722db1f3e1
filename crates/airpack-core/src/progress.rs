//! Progress reporting
//!
//! Long-running operations take a reporter handle instead of touching any
//! global spinner. Library code only ever sees the trait.

use std::sync::Mutex;

/// Receives progress events from a long-running operation
pub trait Progress: Send + Sync {
    /// A new phase begins
    fn start(&self, message: &str);

    /// Status update within the current phase
    fn update(&self, message: &str);

    /// The current phase finished successfully
    fn success(&self, message: &str);

    /// The current phase failed
    fn fail(&self, message: &str);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _message: &str) {}
    fn update(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
    fn fail(&self, _message: &str) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn start(&self, message: &str) {
        tracing::info!("{}", message);
    }
    fn update(&self, message: &str) {
        tracing::debug!("{}", message);
    }
    fn success(&self, message: &str) {
        tracing::info!("{}", message);
    }
    fn fail(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Event captured by [`RecordingProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Start(String),
    Update(String),
    Success(String),
    Fail(String),
}

/// Records events in memory, for tests and for callers that render later
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Progress for RecordingProgress {
    fn start(&self, message: &str) {
        self.push(ProgressEvent::Start(message.to_string()));
    }
    fn update(&self, message: &str) {
        self.push(ProgressEvent::Update(message.to_string()));
    }
    fn success(&self, message: &str) {
        self.push(ProgressEvent::Success(message.to_string()));
    }
    fn fail(&self, message: &str) {
        self.push(ProgressEvent::Fail(message.to_string()));
    }
}
