//! Storage-side contract of the validation pipeline, independent of any
//! particular database.
pub mod client {
    pub mod memory;
    pub mod store;

    pub use memory::MemoryStore;
    pub use store::{StoreError, StoreResult, ValidationStore};
}

pub mod model {
    pub mod configuration;

    pub use configuration::{ConfigError, StoreConfig, StoreConfigBuilder};
}

pub use client::{MemoryStore, StoreError, StoreResult, ValidationStore};
pub use model::{ConfigError, StoreConfig};
