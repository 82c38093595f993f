//! TLS listener for node-to-node traffic.
//!
//! Mutual authentication: client certificates are verified against the
//! configured CA, and the subject CN is the requesting node's name. The CN
//! must name a configured mesh member. Handshakes run on the handler
//! thread, never on the accept path, so a slow peer cannot stall accepts.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::Sender;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::auth::Caller;
use crate::config::{Limits, MeshConfig};
use crate::daemon::identity::Transport;
use crate::daemon::mesh::MeshState;
use crate::daemon::repl::ReplEvent;
use crate::daemon::server::{CommandMessage, Conn, Handler, HandlerPool};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("tls io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("bad certificate material in {path}: {reason}")]
    BadPem { path: String, reason: String },

    #[error("peer presented no client certificate")]
    NoClientCert,

    #[error("peer certificate has no subject CN")]
    NoCommonName,

    #[error("peer {0:?} is not a configured mesh member")]
    UnknownNode(String),
}

/// Build the server-side TLS configuration from mesh config.
pub fn server_config(mesh: &MeshConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&mesh.ca_cert)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::BadPem {
                path: mesh.ca_cert.display().to_string(),
                reason: e.to_string(),
            })?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&mesh.node_cert)?, load_key(&mesh.node_key)?)?;
    Ok(Arc::new(config))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::BadPem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| TlsError::BadPem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if certs.is_empty() {
        return Err(TlsError::BadPem {
            path: path.display().to_string(),
            reason: "no certificates found".into(),
        });
    }
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::BadPem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::BadPem {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::BadPem {
            path: path.display().to_string(),
            reason: "no private key found".into(),
        })
}

/// Subject CN of the verified peer certificate: the requesting node's name.
pub fn peer_node_name(conn: &ServerConnection) -> Result<String, TlsError> {
    let certs = conn.peer_certificates().ok_or(TlsError::NoClientCert)?;
    let der = certs.first().ok_or(TlsError::NoClientCert)?;
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|_| TlsError::NoClientCert)?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or(TlsError::NoCommonName)
}

/// Accept loop for the TLS listener. Returns on shutdown; bind and accept
/// errors bubble up so the supervisor can restart the listener.
#[allow(clippy::too_many_arguments)]
pub fn run_tls_listener(
    mesh: &MeshConfig,
    limits: &Limits,
    shutdown: &Arc<AtomicBool>,
    cmd_tx: &Sender<CommandMessage>,
    pool: &HandlerPool,
    state: &Arc<MeshState>,
    repl_tx: &Sender<ReplEvent>,
) -> Result<(), TlsError> {
    let config = server_config(mesh)?;
    let listener = TcpListener::bind(("0.0.0.0", mesh.tls_port))?;
    listener.set_nonblocking(true)?;
    tracing::info!(port = mesh.tls_port, "tls listener up");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(guard) = pool.try_acquire() else {
                    tracing::warn!(%peer, "handler pool saturated, refusing connection");
                    drop(stream);
                    continue;
                };
                let config = Arc::clone(&config);
                let cmd_tx = cmd_tx.clone();
                let state = Arc::clone(state);
                let repl_tx = repl_tx.clone();
                let idle = limits.idle_timeout();
                let buffer_cap = limits.max_frame_buffer_bytes;
                let metadata_allowed = mesh.accept_frame_metadata;
                std::thread::spawn(move || {
                    if let Err(e) = serve_tls_conn(
                        stream,
                        config,
                        idle,
                        buffer_cap,
                        metadata_allowed,
                        &cmd_tx,
                        &state,
                        &repl_tx,
                        guard,
                    ) {
                        tracing::warn!(%peer, "tls connection rejected: {e}");
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Handshake off the accept path, then hand the stream to the shared
/// handler logic tagged as a remote transport.
#[allow(clippy::too_many_arguments)]
fn serve_tls_conn(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    idle: Option<Duration>,
    buffer_cap: usize,
    metadata_allowed: bool,
    cmd_tx: &Sender<CommandMessage>,
    state: &Arc<MeshState>,
    repl_tx: &Sender<ReplEvent>,
    guard: crate::daemon::server::PoolGuard,
) -> Result<(), TlsError> {
    stream.set_nonblocking(false)?;
    // Bound the handshake so a stalled peer cannot pin the thread.
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let mut stream = stream;
    let mut conn = ServerConnection::new(config)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)?;
    }

    let node = peer_node_name(&conn)?;
    if !state.is_member(&node) {
        return Err(TlsError::UnknownNode(node));
    }

    stream.set_read_timeout(idle)?;
    stream.set_write_timeout(None)?;

    if state.connected(&node) {
        let _ = repl_tx.send(ReplEvent::NodeJoin { node: node.clone() });
    }
    tracing::info!(node = %node, "node connected");

    let caller = Caller::remote(node.clone(), None);
    let handler = Handler::new(
        Conn::Tls(Box::new(StreamOwned::new(conn, stream))),
        Transport::Tls,
        caller,
        buffer_cap,
        metadata_allowed,
        guard,
    );
    handler.run(cmd_tx);

    if state.disconnected(&node) {
        let _ = repl_tx.send(ReplEvent::NodeLeave { node: node.clone() });
    }
    tracing::info!(node = %node, "node disconnected");
    Ok(())
}
