use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Sink for progress reports of a running procedure.
///
/// Cancelling the token returned by [`Progress::cancellation`] aborts the
/// call the progress is attached to.
pub trait Progress: Send + Sync {
    fn start(&self, message: &str);
    fn set_value(&self, fraction: f64);
    fn end(&self);
    fn cancellation(&self) -> CancellationToken;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Start(String),
    Value(f64),
    End,
}

/// A [`Progress`] that records everything it is told and logs it
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    cancel: CancellationToken,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Simulate the user pressing cancel
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Progress for RecordingProgress {
    fn start(&self, message: &str) {
        tracing::info!("{}", message);
        self.events.lock().push(ProgressEvent::Start(message.to_string()));
    }

    fn set_value(&self, fraction: f64) {
        self.events
            .lock()
            .push(ProgressEvent::Value(fraction.clamp(0.0, 1.0)));
    }

    fn end(&self) {
        self.events.lock().push(ProgressEvent::End);
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
