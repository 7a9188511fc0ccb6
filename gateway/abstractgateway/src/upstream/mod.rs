pub mod batch;
pub mod event;
pub mod legacy;

pub use batch::{Batch, BatchEnvelope, BatchError, MAX_BATCH_SIZE};
pub use event::{Amount, AmountError, ValidationEvent};
pub use legacy::{LegacyValidationEvent, ValidationResult};
