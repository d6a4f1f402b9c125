use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Sink for progress of long-running operations.
///
/// The CLI implements it with indicatif; tests use [`ChannelReporter`].
/// All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// Work of unknown duration has started (hashing, finalizing).
    fn on_indeterminate(&self, _message: &str) {}
    /// The next bounded phase runs from `min` to `max`.
    fn on_bounds(&self, _min: u64, _max: u64) {}
    fn on_progress(&self, _value: u64) {}
    fn on_message(&self, _message: &str) {}
    fn on_error(&self, _message: &str) {}
    fn on_finished(&self, _summary: &str) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Indeterminate(String),
    Bounds { min: u64, max: u64 },
    Progress(u64),
    Message(String),
    Error(String),
    Finished(String),
}

/// Forwards every callback as a [`ProgressEvent`] over an mpsc channel.
pub struct ChannelReporter {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        if let Ok(tx) = self.tx.lock() {
            // receiver may be gone; progress is best effort
            let _ = tx.send(event);
        }
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_indeterminate(&self, message: &str) {
        self.send(ProgressEvent::Indeterminate(message.to_string()));
    }

    fn on_bounds(&self, min: u64, max: u64) {
        self.send(ProgressEvent::Bounds { min, max });
    }

    fn on_progress(&self, value: u64) {
        self.send(ProgressEvent::Progress(value));
    }

    fn on_message(&self, message: &str) {
        self.send(ProgressEvent::Message(message.to_string()));
    }

    fn on_error(&self, message: &str) {
        self.send(ProgressEvent::Error(message.to_string()));
    }

    fn on_finished(&self, summary: &str) {
        self.send(ProgressEvent::Finished(summary.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_reporter_preserves_order() {
        let (tx, rx) = mpsc::channel();
        let reporter = ChannelReporter::new(tx);
        reporter.on_indeterminate("hashing");
        reporter.on_bounds(0, 2);
        reporter.on_progress(1);
        reporter.on_finished("done");
        drop(reporter);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(
            events,
            vec![
                ProgressEvent::Indeterminate("hashing".to_string()),
                ProgressEvent::Bounds { min: 0, max: 2 },
                ProgressEvent::Progress(1),
                ProgressEvent::Finished("done".to_string()),
            ]
        );
    }
}
