use serde::{Deserialize, Serialize};

use super::event::ValidationEvent;

/// Upper bound for any batch: transport batches, disk flushes, bulk persists.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch is full ({0} events)")]
    Full(usize),
    #[error("batch of {size} events exceeds the limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Ordered, bounded group of events headed for one downstream call.
/// Carries no identity of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    events: Vec<ValidationEvent>,
    limit: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Self::with_limit(MAX_BATCH_SIZE)
    }

    /// Limit is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.clamp(1, MAX_BATCH_SIZE);
        Self {
            events: Vec::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, event: ValidationEvent) -> Result<(), BatchError> {
        if self.is_full() {
            return Err(BatchError::Full(self.limit));
        }
        self.events.push(event);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.limit
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn events(&self) -> &[ValidationEvent] {
        &self.events
    }

    /// Hand the members out and leave an empty batch with the same limit behind.
    pub fn take(&mut self) -> Vec<ValidationEvent> {
        std::mem::replace(&mut self.events, Vec::with_capacity(self.limit))
    }

    pub fn into_events(self) -> Vec<ValidationEvent> {
        self.events
    }

    /// Split an arbitrary list into batches of at most `MAX_BATCH_SIZE`, preserving order.
    pub fn chunks(events: Vec<ValidationEvent>) -> Vec<Batch> {
        let mut out = Vec::with_capacity(events.len().div_ceil(MAX_BATCH_SIZE));
        let mut current = Batch::new();
        for evt in events {
            if current.is_full() {
                out.push(std::mem::take(&mut current));
            }
            current.events.push(evt);
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

/// Transport-level batch: ordered events plus an optional batch id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub events: Vec<ValidationEvent>,
}

impl BatchEnvelope {
    pub fn new(events: Vec<ValidationEvent>) -> Self {
        Self {
            batch_id: Some(uuid::Uuid::new_v4().to_string()),
            events,
        }
    }

    /// Reject envelopes above the batch limit instead of silently truncating.
    pub fn into_batch(self) -> Result<Batch, BatchError> {
        if self.events.len() > MAX_BATCH_SIZE {
            return Err(BatchError::TooLarge {
                size: self.events.len(),
                limit: MAX_BATCH_SIZE,
            });
        }
        Ok(Batch {
            events: self.events,
            limit: MAX_BATCH_SIZE,
        })
    }
}
