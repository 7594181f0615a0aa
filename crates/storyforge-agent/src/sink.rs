//! Outbound event channel.
//!
//! Events go to the caller over a bounded channel, so a slow consumer applies
//! backpressure to the producing handler. When the receiving side goes away
//! the run's cancellation token fires and every in-flight backend call stops.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use storyforge_core::protocol::StreamingEvent;

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamingEvent>,
    cancel: CancellationToken,
    journal: Arc<Mutex<Vec<StreamingEvent>>>,
}

impl EventSink {
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<StreamingEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                cancel,
                journal: Arc::new(Mutex::new(Vec::new())),
            },
            rx,
        )
    }

    /// Send one event, waiting for channel capacity. Returns `false` once the
    /// receiver is gone.
    pub async fn emit(&self, event: StreamingEvent) -> bool {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(event.clone());
        }
        if self.tx.send(event).await.is_err() {
            if !self.cancel.is_cancelled() {
                debug!("Event receiver dropped, cancelling run");
                self.cancel.cancel();
            }
            return false;
        }
        true
    }

    /// Events emitted since the last call, in emission order.
    pub fn take_journal(&self) -> Vec<StreamingEvent> {
        self.journal
            .lock()
            .map(|mut j| std::mem::take(&mut *j))
            .unwrap_or_default()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_in_order_and_journal() {
        let (sink, mut rx) = EventSink::channel(4, CancellationToken::new());
        assert!(sink.emit(StreamingEvent::status("a")).await);
        assert!(sink.emit(StreamingEvent::chat("b")).await);
        assert_eq!(rx.recv().await.unwrap().content, "a");
        assert_eq!(rx.recv().await.unwrap().content, "b");

        let journal = sink.take_journal();
        assert_eq!(journal.len(), 2);
        assert!(sink.take_journal().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let cancel = CancellationToken::new();
        let (sink, rx) = EventSink::channel(1, cancel.clone());
        drop(rx);
        assert!(!sink.emit(StreamingEvent::chat("x")).await);
        assert!(cancel.is_cancelled());
    }
}
