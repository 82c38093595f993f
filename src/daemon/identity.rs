//! Connection identity resolution.
//!
//! Identity is resolved exactly once, at connection start, and is immutable
//! for the life of the connection. Local connections carry the kernel's
//! peer credentials; remote connections carry the certificate CN extracted
//! during the TLS handshake (see `daemon::tls`).

use std::io;
use std::os::unix::net::UnixStream;

use nix::sys::socket::getsockopt;
use nix::sys::socket::sockopt::PeerCredentials;

use crate::auth::Caller;

/// Which listener a connection arrived on. The handler logic is shared;
/// this tag is what varies its behavior (identity source, metadata policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unix,
    Tls,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Unix => "unix",
            Transport::Tls => "tls",
        }
    }
}

/// Resolve a local caller from `SO_PEERCRED`. The kernel reports the UID of
/// the connecting process; nothing the peer sends can change it.
pub fn resolve_local(stream: &UnixStream) -> io::Result<Caller> {
    let creds = getsockopt(stream, PeerCredentials).map_err(io::Error::from)?;
    Ok(Caller::local(creds.uid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn peer_uid_is_our_own_on_a_loopback_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let client = UnixStream::connect(&path).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let caller = resolve_local(&server_side).unwrap();
        assert_eq!(caller.uid, Some(nix::unistd::geteuid().as_raw()));
        assert!(caller.node.is_none());
        drop(client);
    }
}
