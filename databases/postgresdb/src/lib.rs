pub mod postgresclient;
pub mod postgresimpl;

pub mod models {
    pub mod transformation;
}

pub use postgresclient::PostgresClient;
pub use postgresimpl::{DbError, PostgresValidationStore};
