//! Concrete transports for the bridge engine
//!
//! Both adapters keep their socket and serial I/O on tokio tasks and meet the
//! engine at bounded channels, so the engine side never blocks.

pub mod rtu;
pub mod tcp;

pub use rtu::{LineOptions, RtuMasterAdapter};
pub use tcp::TcpServerAdapter;
