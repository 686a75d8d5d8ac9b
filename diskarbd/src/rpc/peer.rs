//! Kernel-verified peer credentials for the Unix-socket RPC surface. The
//! original daemon reads the caller's euid/egid out of the connection's
//! `audit_token_t` (`DAServer.c`'s `audit_token_to_euid`/`_egid`), a
//! kernel-stamped value the client cannot forge; this is the `SO_PEERCRED`
//! equivalent on Linux, captured once per connection and carried into every
//! RPC on it via tonic's `Connected` extension mechanism rather than trusted
//! off the wire.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;
use tonic::transport::server::Connected;

#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone)]
pub struct UdsConnectInfo {
    pub peer: Option<PeerCredentials>,
}

/// Wraps an accepted `UnixStream`, capturing `SO_PEERCRED` before the
/// connection is handed to tonic so every request on it can look the caller
/// up via `peer_credentials`.
pub struct AuthenticatedUnixStream {
    inner: UnixStream,
    peer: Option<PeerCredentials>,
}

impl AuthenticatedUnixStream {
    pub fn new(inner: UnixStream) -> Self {
        let peer = inner
            .peer_cred()
            .ok()
            .map(|cred| PeerCredentials { uid: cred.uid(), gid: cred.gid() });
        Self { inner, peer }
    }
}

impl Connected for AuthenticatedUnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo { peer: self.peer }
    }
}

impl AsyncRead for AuthenticatedUnixStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AuthenticatedUnixStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Looks up the connection's kernel-verified peer credentials, stashed by
/// tonic into the request's extensions at accept time. `None` only when the
/// transport isn't `AuthenticatedUnixStream` (e.g. a test harness calling
/// the service directly) or the kernel lookup failed at accept time.
pub fn peer_credentials<T>(request: &tonic::Request<T>) -> Option<PeerCredentials> {
    request.extensions().get::<UdsConnectInfo>().and_then(|info| info.peer)
}
