//! Crate-level error type.

use thiserror::Error;

use crate::client::ClientError;
use crate::proto::MessageError;
use crate::server::ServerError;
use crate::session::StoreError;

/// Thin wrapper over the per-module errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),
}
