//! Per-client session state: store contract and in-memory implementation.

pub mod memory;
pub mod shared;
pub mod store;

pub use memory::{InMemoryStore, InMemoryStoreParams};
pub use shared::SharedSessionStore;
pub use store::{NextOutcome, SessionStore, SessionView, StoreError, resolve_next};
