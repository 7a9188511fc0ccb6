use std::time::Duration;

use abstractgateway::ValidationEvent;
use tokio::time::Instant;

/// Event on its way to the store, with the number of failed persist attempts
/// it has been through.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event: ValidationEvent,
    pub attempts: u32,
}

impl PendingEvent {
    pub fn new(event: ValidationEvent) -> Self {
        Self { event, attempts: 0 }
    }
}

impl From<ValidationEvent> for PendingEvent {
    fn from(event: ValidationEvent) -> Self {
        Self::new(event)
    }
}

/// Size/age accumulator. Holds no timer of its own; the owning task asks
/// [`Batcher::is_due`] on each tick.
#[derive(Debug)]
pub struct Batcher {
    buf: Vec<PendingEvent>,
    max_size: usize,
    max_age: Duration,
    oldest: Option<Instant>,
}

impl Batcher {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            buf: Vec::with_capacity(max_size),
            max_size,
            max_age,
            oldest: None,
        }
    }

    /// Add one event; returns a full batch when the size limit is reached.
    pub fn push(&mut self, item: PendingEvent) -> Option<Vec<PendingEvent>> {
        if self.buf.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.buf.push(item);
        if self.buf.len() >= self.max_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Drain whatever is buffered.
    pub fn take(&mut self) -> Vec<PendingEvent> {
        self.oldest = None;
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.max_size))
    }

    /// Put a batch that could not be handed off back in front of whatever
    /// is buffered. May exceed `max_size`; the next `take` returns it all.
    pub fn restore(&mut self, mut batch: Vec<PendingEvent>) {
        if batch.is_empty() {
            return;
        }
        if self.buf.is_empty() {
            self.oldest = Some(Instant::now());
        }
        batch.append(&mut self.buf);
        self.buf = batch;
    }

    /// Non-empty and the oldest event has waited at least `max_age`.
    pub fn is_due(&self) -> bool {
        self.oldest.map_or(false, |t| t.elapsed() >= self.max_age)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
