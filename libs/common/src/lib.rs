//! Shared service plumbing for bridgesrv
//!
//! Provides the pieces every service binary needs, independent of the
//! bridging logic:
//! - logging bootstrap (console, rolling file, log mirror)
//! - hex dumps of raw frames
//! - shutdown signal handling
//! - startup banner

pub mod hex;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

// Re-export common dependencies
pub use anyhow;
pub use tokio;
