//! Server loops.
//!
//! Three kinds of thread:
//! - acceptors (one per listener) - accept sockets, spawn handlers
//! - handler threads (one per connection) - frame the byte stream, forward
//!   commands, write responses
//! - the state thread - owns the [`Dispatcher`] and is THE serialization
//!   point: every store call happens here, in arrival order per connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use rmpv::Value;
use rustls::{ServerConnection, StreamOwned};

use crate::auth::Caller;
use crate::daemon::dispatch::Dispatcher;
use crate::daemon::identity::Transport;
use crate::daemon::proto::{self, FrameDecoder, ProtoError, RequestFrame};
use crate::store::record;

/// Message from a handler thread to the state thread.
pub struct CommandMessage {
    pub caller: Caller,
    pub frame: RequestFrame,
    pub respond: Sender<Reply>,
}

/// The state thread's answer, ready to encode.
pub struct Reply {
    pub msgid: i64,
    pub result: Result<Value, &'static str>,
}

/// Run the state thread until shutdown is flagged or every sender is gone.
pub fn run_state_loop(
    dispatcher: Dispatcher,
    cmd_rx: Receiver<CommandMessage>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(msg) => {
                let reply = process(&dispatcher, &msg);
                let _ = msg.respond.send(reply);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("state thread stopped");
}

fn process(dispatcher: &Dispatcher, msg: &CommandMessage) -> Reply {
    let msgid = msg.frame.msgid;
    // A handler bug must cost one error response, not the daemon.
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        dispatcher.dispatch(&msg.caller, &msg.frame)
    }));
    match outcome {
        Ok(Ok(value)) => Reply {
            msgid,
            result: Ok(value),
        },
        Ok(Err(err)) => {
            let code = err.code();
            if code == "internal" {
                tracing::error!(method = %msg.frame.method, "store fault: {err}");
            }
            Reply {
                msgid,
                result: Err(code),
            }
        }
        Err(_) => {
            tracing::error!(method = %msg.frame.method, "dispatch panicked");
            Reply {
                msgid,
                result: Err("internal"),
            }
        }
    }
}

/// Bounded handler pool. Saturation closes new sockets at accept time.
#[derive(Clone)]
pub struct HandlerPool {
    active: Arc<AtomicUsize>,
    cap: usize,
}

impl HandlerPool {
    pub fn new(cap: usize) -> HandlerPool {
        HandlerPool {
            active: Arc::new(AtomicUsize::new(0)),
            cap: cap.max(1),
        }
    }

    pub fn try_acquire(&self) -> Option<PoolGuard> {
        let cap = self.cap;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < cap { Some(n + 1) } else { None }
            })
            .ok()
            .map(|_| PoolGuard {
                active: Arc::clone(&self.active),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII slot in the handler pool.
pub struct PoolGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection's byte stream. The handler logic is transport-polymorphic
/// through this tag, not through generics: the variance is narrow (identity
/// source, metadata policy) and stable.
pub enum Conn {
    Unix(UnixStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Unix(stream) => stream.read(buf),
            Conn::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Conn::Unix(stream) => stream.write(buf),
            Conn::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Conn::Unix(stream) => stream.flush(),
            Conn::Tls(stream) => stream.flush(),
        }
    }
}

/// Per-connection state: transport tag, immutable identity, frame buffer.
pub struct Handler {
    conn: Conn,
    transport: Transport,
    caller: Caller,
    decoder: FrameDecoder,
    metadata_allowed: bool,
    _guard: PoolGuard,
}

impl Handler {
    pub fn new(
        conn: Conn,
        transport: Transport,
        caller: Caller,
        buffer_cap: usize,
        metadata_allowed: bool,
        guard: PoolGuard,
    ) -> Handler {
        Handler {
            conn,
            transport,
            caller,
            decoder: FrameDecoder::new(buffer_cap),
            metadata_allowed,
            _guard: guard,
        }
    }

    /// Read frames until the peer goes away, the idle timeout fires, or a
    /// framing fault kills the connection.
    pub fn run(mut self, cmd_tx: &Sender<CommandMessage>) {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = match self.conn.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    tracing::debug!(transport = self.transport.as_str(), "idle timeout");
                    return;
                }
                Err(e) => {
                    tracing::debug!("read error: {e}");
                    return;
                }
            };

            if let Err(e) = self.decoder.extend(&chunk[..n]) {
                // Over-cap input is dropped unprocessed, per the cap contract.
                tracing::warn!(
                    transport = self.transport.as_str(),
                    "closing connection: {e}"
                );
                return;
            }

            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if !self.serve_frame(frame, cmd_tx) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(ProtoError::InvalidRequest { msgid }) => {
                        if !self.send_error(msgid, "invalid_request") {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            transport = self.transport.as_str(),
                            "closing connection: {e}"
                        );
                        // Best effort: name the fault before hanging up.
                        let _ = self.send_error(0, e.code());
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the connection should close.
    fn serve_frame(&mut self, mut frame: RequestFrame, cmd_tx: &Sender<CommandMessage>) -> bool {
        let mut caller = self.caller.clone();
        if let Some(metadata) = frame.metadata.take() {
            // 5-element frames only mean something on an authenticated
            // node-to-node link, and only when explicitly enabled. A local
            // client must never smuggle claims about a remote requester.
            let accepted = self.transport == Transport::Tls && self.metadata_allowed;
            if !accepted {
                return self.send_error(frame.msgid, "invalid_request");
            }
            if let Some(uid) = record::get_field(&metadata, "origin_uid").and_then(Value::as_u64) {
                caller.uid = u32::try_from(uid).ok();
            }
        }

        let msgid = frame.msgid;
        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        if cmd_tx
            .send(CommandMessage {
                caller,
                frame,
                respond: respond_tx,
            })
            .is_err()
        {
            return false; // state thread gone
        }
        let reply = match respond_rx.recv() {
            Ok(reply) => reply,
            Err(_) => return false,
        };

        debug_assert_eq!(reply.msgid, msgid);
        match reply.result {
            Ok(value) => self.send_result(reply.msgid, value),
            Err(code) => self.send_error(reply.msgid, code),
        }
    }

    fn send_result(&mut self, msgid: i64, value: Value) -> bool {
        match proto::encode_result(msgid, value) {
            Ok(bytes) => self.send_bytes(&bytes),
            Err(e) => {
                tracing::error!("{e}");
                self.send_error(msgid, "internal")
            }
        }
    }

    fn send_error(&mut self, msgid: i64, code: &str) -> bool {
        match proto::encode_error(msgid, code) {
            Ok(bytes) => self.send_bytes(&bytes),
            Err(e) => {
                tracing::error!("{e}");
                false
            }
        }
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> bool {
        self.conn.write_all(bytes).is_ok() && self.conn.flush().is_ok()
    }
}
