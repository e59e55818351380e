use std::sync::Mutex;

use tokio::sync::mpsc;

use strand_core::{EventEmitter, RuntimeEvent};

/// Receiving side of a recording emitter.
pub struct RecordedEvents {
    rx: Mutex<mpsc::UnboundedReceiver<RuntimeEvent>>,
}

impl RecordedEvents {
    /// Everything emitted so far, in order.
    pub fn drain(&self) -> Vec<RuntimeEvent> {
        let mut rx = self.rx.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }
}

/// An emitter whose events can be inspected after the fact.
pub fn recording_emitter() -> (EventEmitter, RecordedEvents) {
    let (emitter, rx) = EventEmitter::channel();
    (emitter, RecordedEvents { rx: Mutex::new(rx) })
}
