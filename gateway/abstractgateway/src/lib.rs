//! Equipment-facing gateway core: the normalized validation event model and
//! the contract every protocol gateway uses to hand events to the pipeline.
pub mod abstractgateway;
pub mod transport;
pub mod upstream;

pub use abstractgateway::{Gateway, IngressSink, SubmitError};
pub use transport::{serve, GatewayTransport};
pub use upstream::{
    Amount, Batch, BatchEnvelope, BatchError, LegacyValidationEvent, ValidationEvent,
    ValidationResult, MAX_BATCH_SIZE,
};
