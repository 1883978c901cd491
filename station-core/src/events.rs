use crate::models::StationEvent;
use log::trace;
use tokio::sync::mpsc;

/// Outgoing side of the event surface. Sending never blocks, and a shell that
/// stopped listening does not affect the work in progress.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StationEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything.
    pub fn disabled() -> Self {
        EventSink { tx: None }
    }

    pub fn emit(&self, event: StationEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Event receiver closed");
            }
        }
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StationEvent::Warning {
            message: message.into(),
        });
    }
}
