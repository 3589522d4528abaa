//! Exam integrity enforcement: incident intake, automatic suspension,
//! payment-driven reinstatement and attempt quotas.

pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod settings;
pub mod store;

pub use engine::IntegrityServices;
pub use error::{IntegrityError, StoreError};
pub use lock::{LockGuard, LockKey, LockManager};
pub use store::IntegrityStore;
