//! Daemon module - the Cortex service.
//!
//! Provides:
//! - MessagePack-RPC framing over stream sockets
//! - Per-connection handlers with kernel-derived identity
//! - The state thread serializing all store access
//! - Unix and (optional) TLS listeners
//! - The scope-driven replication driver

pub mod dispatch;
pub mod identity;
pub mod mesh;
pub mod proto;
pub mod repl;
pub mod run;
pub mod server;
pub mod tls;

pub use dispatch::{Dispatcher, MeshView};
pub use identity::Transport;
pub use proto::{FrameDecoder, ProtoError, RequestFrame};
pub use repl::{NullTransport, PlacementBoard, ReplDriver, ReplEvent, ReplicaTransport};
pub use run::{DaemonHandle, run_daemon, start};
pub use server::{CommandMessage, Handler, HandlerPool, Reply, run_state_loop};
pub use tls::TlsError;
