//! Daemon bootstrap and teardown.
//!
//! Bring-up order: runtime dir, stale-socket check, store, channels, state
//! thread, replication driver, TLS supervisor, Unix accept loop. Teardown
//! reverses it and unlinks the socket file.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::config::Config;
use crate::daemon::dispatch::{Dispatcher, MeshView};
use crate::daemon::identity::{self, Transport};
use crate::daemon::mesh::MeshState;
use crate::daemon::repl::{NullTransport, PlacementBoard, ReplDriver, ReplEvent};
use crate::daemon::server::{CommandMessage, Conn, Handler, HandlerPool, run_state_loop};
use crate::daemon::tls;
use crate::store::{HmacClaimSigner, Store};

#[derive(Serialize)]
struct DaemonInfo {
    version: &'static str,
    pid: u32,
}

/// A running daemon. Dropping the handle does not stop it; call
/// [`DaemonHandle::shutdown`].
pub struct DaemonHandle {
    shutdown: Arc<AtomicBool>,
    socket_path: PathBuf,
    meta_path: PathBuf,
    accept: JoinHandle<()>,
    state: JoinHandle<()>,
    tls: Option<JoinHandle<()>>,
    repl: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Stop every loop, join the threads, and reclaim the socket file.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.accept.join();
        let _ = self.state.join();
        if let Some(tls) = self.tls {
            let _ = tls.join();
        }
        if let Some(repl) = self.repl {
            let _ = repl.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.meta_path);
        tracing::info!("daemon stopped");
    }
}

/// Bind, bootstrap, and spawn every daemon thread. Returns once the daemon
/// is accepting connections.
pub fn start(config: Config) -> Result<DaemonHandle> {
    let socket_path = config.socket_path.clone();
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir).map_err(crate::Error::Io)?;
    }
    std::fs::create_dir_all(&config.data_dir).map_err(crate::Error::Io)?;

    // A live daemon on the socket wins; a dead one left a stale file.
    if UnixStream::connect(&socket_path).is_ok() {
        return Err(crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("daemon already listening on {}", socket_path.display()),
        )));
    }
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(crate::Error::Io)?;
    // Access policy is ACL-based, enforced from peer credentials; the socket
    // itself is world-connectable on purpose.
    let _ = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666));
    listener.set_nonblocking(true).map_err(crate::Error::Io)?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    let meta_path = socket_path.with_file_name("daemon.meta.json");
    let info = DaemonInfo {
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    };
    let _ = std::fs::write(
        &meta_path,
        serde_json::to_vec(&info).unwrap_or_else(|_| b"{}".to_vec()),
    );

    let node_name = config.effective_node_name();
    let signer = Box::new(HmacClaimSigner::from_secret(
        config.mesh.as_ref().and_then(|m| m.claim_secret.as_deref()),
    ));
    let store = Arc::new(Store::open(
        &config.database_path(),
        &node_name,
        signer,
    )?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let pool = HandlerPool::new(config.limits.max_connections);
    let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded::<CommandMessage>();

    // Mesh wiring is all-or-nothing: no mesh config means no TLS listener
    // and no replication driver.
    let mut tls_thread = None;
    let mut repl_thread = None;
    let mesh_view = match &config.mesh {
        Some(mesh_config) => {
            let peers: Vec<String> = mesh_config
                .nodes
                .iter()
                .map(|n| n.name.clone())
                .filter(|n| *n != node_name)
                .collect();
            let mesh_state = Arc::new(MeshState::new(peers.clone()));
            let board = PlacementBoard::new();
            let (repl_tx, repl_rx) = crossbeam::channel::unbounded::<ReplEvent>();

            let driver = ReplDriver::new(
                Arc::clone(&store),
                Box::new(NullTransport),
                peers.clone(),
                board.clone(),
            );
            repl_thread = Some(
                std::thread::Builder::new()
                    .name("cortex-repl".into())
                    .spawn(move || driver.run(repl_rx))
                    .map_err(crate::Error::Io)?,
            );

            tls_thread = Some(spawn_tls_supervisor(
                mesh_config.clone(),
                config.limits.clone(),
                Arc::clone(&shutdown),
                cmd_tx.clone(),
                pool.clone(),
                Arc::clone(&mesh_state),
                repl_tx.clone(),
            )?);

            Some(MeshView {
                state: mesh_state,
                peers,
                repl_tx,
                placement: board,
            })
        }
        None => None,
    };

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        mesh_view,
        config.data_dir.display().to_string(),
    );
    let state = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("cortex-state".into())
            .spawn(move || run_state_loop(dispatcher, cmd_rx, shutdown))
            .map_err(crate::Error::Io)?
    };

    let accept = {
        let shutdown = Arc::clone(&shutdown);
        let limits = config.limits.clone();
        std::thread::Builder::new()
            .name("cortex-accept".into())
            .spawn(move || run_unix_accept_loop(listener, cmd_tx, pool, limits, shutdown))
            .map_err(crate::Error::Io)?
    };

    Ok(DaemonHandle {
        shutdown,
        socket_path,
        meta_path,
        accept,
        state,
        tls: tls_thread,
        repl: repl_thread,
    })
}

/// Run the daemon in the current process until SIGTERM/SIGINT.
pub fn run_daemon(config: Config) -> Result<()> {
    let handle = match start(config) {
        Ok(handle) => handle,
        Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::warn!("{e}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop));
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    handle.shutdown();
    Ok(())
}

fn run_unix_accept_loop(
    listener: UnixListener,
    cmd_tx: crossbeam::channel::Sender<CommandMessage>,
    pool: HandlerPool,
    limits: crate::config::Limits,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let Some(guard) = pool.try_acquire() else {
                    tracing::warn!("handler pool saturated, refusing connection");
                    drop(stream);
                    continue;
                };
                let cmd_tx = cmd_tx.clone();
                let idle = limits.idle_timeout();
                let buffer_cap = limits.max_frame_buffer_bytes;
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    let _ = stream.set_read_timeout(idle);
                    // Identity comes from the kernel, once, before any frame.
                    let caller = match identity::resolve_local(&stream) {
                        Ok(caller) => caller,
                        Err(e) => {
                            tracing::warn!("peer credential lookup failed: {e}");
                            return;
                        }
                    };
                    Handler::new(
                        Conn::Unix(stream),
                        Transport::Unix,
                        caller,
                        buffer_cap,
                        false,
                        guard,
                    )
                    .run(&cmd_tx);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }
}

/// Keep the TLS listener alive: rebind and resume after a listener fault.
#[allow(clippy::too_many_arguments)]
fn spawn_tls_supervisor(
    mesh: crate::config::MeshConfig,
    limits: crate::config::Limits,
    shutdown: Arc<AtomicBool>,
    cmd_tx: crossbeam::channel::Sender<CommandMessage>,
    pool: HandlerPool,
    state: Arc<MeshState>,
    repl_tx: crossbeam::channel::Sender<ReplEvent>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cortex-tls".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match tls::run_tls_listener(
                    &mesh, &limits, &shutdown, &cmd_tx, &pool, &state, &repl_tx,
                ) {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::error!("tls listener failed, restarting: {e}");
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .map_err(crate::Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.socket_path = dir.path().join("cortex.sock");
        config.data_dir = dir.path().join("data");
        config
    }

    #[test]
    fn start_shutdown_reclaims_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let socket = config.socket_path.clone();

        let handle = start(config).unwrap();
        assert!(socket.exists());
        assert!(UnixStream::connect(&socket).is_ok());
        handle.shutdown();
        assert!(!socket.exists());
    }

    #[test]
    fn second_daemon_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let handle = start(config.clone()).unwrap();
        assert!(start(config).is_err());
        handle.shutdown();
    }
}
