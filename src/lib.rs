#![forbid(unsafe_code)]

//! Cortex: a local storage daemon.
//!
//! An embedded, transactional, table-oriented record store exposed over a
//! Unix domain socket (plus an optional mutually-authenticated TLS listener
//! for inter-node traffic). Caller identity comes from the kernel's peer
//! credentials locally and from the client certificate subject remotely, so
//! no bearer credential ever crosses a trust boundary.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod error;
mod paths;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use auth::{Caller, Operation, authorize};
pub use config::Config;
pub use daemon::{DaemonHandle, run_daemon, start};
pub use store::{NodeScope, Store, StoreError};
