//! The `DiskArbitration` gRPC surface (spec.md §6).
//!
//! `server::RpcServer` is the only thing in this crate that is `Send`: it
//! holds nothing but an `mpsc::UnboundedSender<DaemonCommand>`, clonable
//! per-connection by tonic, and every method is a send-command/await-reply
//! round trip into `daemon::run`'s single-threaded loop (see `daemon.rs`'s
//! module doc for why).

mod peer;
mod server;

pub use peer::{peer_credentials, AuthenticatedUnixStream, PeerCredentials, UdsConnectInfo};
pub use server::RpcServer;
