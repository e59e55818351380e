use tokio::sync::{broadcast, mpsc};

use crate::types::{RunId, RuntimeEvent};

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of a single run.
    pub fn subscribe_run(&self, run_id: RunId) -> RunEvents {
        RunEvents {
            run_id,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Live events for one run.
pub struct RunEvents {
    run_id: RunId,
    rx: broadcast::Receiver<RuntimeEvent>,
}

impl RunEvents {
    /// Next event for this run, or `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<RuntimeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.run_id == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(run_id = %self.run_id, skipped = n, "RunEvents lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Explicit event sink threaded through node execution.
///
/// Cloned into every `NodeContext`; the runtime drains the receiving end
/// into its event stream in emission order.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<RuntimeEvent>>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that drops everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: RuntimeEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    #[tokio::test]
    async fn run_events_filters_by_run() {
        let bus = EventBus::default();
        let wanted = RunId::from("r1");
        let mut events = bus.subscribe_run(wanted.clone());

        bus.publish(RuntimeEvent::new(EventKind::NodeStart, RunId::from("r2"), "other"));
        bus.publish(RuntimeEvent::new(EventKind::NodeStart, wanted.clone(), "mine"));

        let ev = events.next().await.unwrap();
        assert_eq!(ev.name, "mine");
        assert_eq!(ev.run_id, wanted);
    }

    #[tokio::test]
    async fn emitter_preserves_order() {
        let (emitter, mut rx) = EventEmitter::channel();
        let run = RunId::from("r1");
        assert!(emitter.emit(RuntimeEvent::new(EventKind::NodeStart, run.clone(), "a")));
        assert!(emitter.emit(RuntimeEvent::new(EventKind::NodeEnd, run, "a")));

        assert_eq!(rx.recv().await.unwrap().event, EventKind::NodeStart);
        assert_eq!(rx.recv().await.unwrap().event, EventKind::NodeEnd);
    }

    #[test]
    fn noop_emitter_reports_closed() {
        let emitter = EventEmitter::noop();
        assert!(emitter.is_closed());
        assert!(!emitter.emit(RuntimeEvent::new(EventKind::Error, RunId::new(), "x")));
    }
}
