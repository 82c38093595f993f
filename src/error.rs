use thiserror::Error;

use crate::daemon::{ProtoError, TlsError};
use crate::daemon::repl::ReplError;
use crate::store::StoreError;

/// Crate-level convenience error: a thin wrapper over the per-layer errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Repl(#[from] ReplError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
