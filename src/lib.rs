#![forbid(unsafe_code)]

//! A small application-layer protocol over WebSocket that streams a
//! finite, server-chosen pseudo-random sequence of u32 values to a
//! client, end-to-end checksummed, with per-message acknowledgement and
//! resumable delivery across reconnects.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod sequence;
pub mod server;
pub mod session;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at the crate root for convenience.
pub use client::{BackoffPolicy, Client, ClientError, ClientParams, RunResult};
pub use proto::{sequence_checksum, AppCloseCode, WireMessage};
pub use sequence::{
    FixedSequenceSource, RandomSequenceSource, SequenceSource, MAX_SEQUENCE_NUMBER_VALUE,
};
pub use server::{Server, ServerConfig, ServerHandle};
pub use session::{
    InMemoryStore, InMemoryStoreParams, SessionStore, SessionView, SharedSessionStore, StoreError,
};
