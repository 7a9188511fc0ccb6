use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::upstream::ValidationEvent;

/// Why an ingress submission was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// All admission slots stayed busy for the whole wait window.
    /// The caller owns the backoff/discard decision; do not spin on it.
    #[error("admission timed out after {0:?}: pipeline saturated")]
    AdmissionTimeout(std::time::Duration),

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("dispatch queue closed")]
    Closed,
}

/// What every protocol gateway hands its normalized events to.
#[async_trait]
pub trait IngressSink: Send + Sync {
    async fn submit(&self, event: ValidationEvent) -> Result<(), SubmitError>;
}

/// Gateway = sink to the pipeline + lifecycle control (cancellation)
#[derive(Clone)]
pub struct Gateway {
    name: String,
    sink: Arc<dyn IngressSink>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(name: impl Into<String>, sink: Arc<dyn IngressSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sink(&self) -> Arc<dyn IngressSink> {
        self.sink.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Forward one decoded event, tagging the result with the gateway name in logs.
    pub async fn forward(&self, event: ValidationEvent) -> Result<(), SubmitError> {
        let equipment_id = event.equipment_id.clone();
        let res = self.sink.submit(event).await;
        if let Err(e) = &res {
            tracing::warn!(gateway = %self.name, %equipment_id, "submit refused: {e}");
        }
        res
    }
}
