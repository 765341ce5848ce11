//! Policy daemon - local RPC endpoint with idle auto-exit
//!
//! The daemon serves calls on a Unix socket and exits by itself once no call
//! has been in flight for the configured idle timeout.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               adpolicyd                  │
//! ├──────────────────────────────────────────┤
//! │  accept loop  │  call hooks  │ idle timer│
//! │  (socket)     │  (tracker)   │ (expiry)  │
//! ├──────────────────────────────────────────┤
//! │        RequestHandler (policy service)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Shutdown, by `quit` or idle expiry, stops accepting first, then waits for
//! in-flight calls unless the quit was forced.

pub mod client;
pub mod idler;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use idler::{CallGuard, CallInfo, ConnectionTracker};
pub use protocol::{MessageFrame, Request, Response};
pub use server::{Daemon, DaemonConfig, RequestHandler, ResponseStream, ShutdownHandle};
