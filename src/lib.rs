pub mod backends;
pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod service;

pub use backends::Backend;
pub use daemon::{Daemon, DaemonConfig};
pub use error::{BackendError, DaemonError, Result};
pub use service::PolicyService;
