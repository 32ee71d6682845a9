//! Modbus TCP to RTU bridge
//!
//! Accepts Modbus TCP requests, queues them, and forwards them one at a time
//! to devices on an RS-485 Modbus RTU line. Replies travel back to the
//! originating client with the original transaction id.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────────────┐    ┌──────────────┐
//! │ TCP clients  │───►│ Bridge engine            │───►│ RTU devices  │
//! │ (MBAP, :502) │◄───│ FIFO queue, one in flight│◄───│ (CRC-16)     │
//! └──────────────┘    └──────────────────────────┘    └──────────────┘
//! ```
//!
//! - **`bridge`**: the engine, driven by a fixed tick
//! - **`queue`** / **`watchdog`** / **`recovery`**: engine building blocks
//! - **`transport`**: seams the engine is generic over, plus in-memory mocks
//! - **`adapters`**: tokio based TCP server and RTU master
//! - **`runtime`**: host loop and restart handling

pub mod adapters;
pub mod bridge;
pub mod config;
pub mod frame;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod telnet;
pub mod transport;
pub mod watchdog;

pub use bridge::{Bridge, BridgeSettings, BridgeStats};
pub use config::BridgeConfig;
pub use queue::{Pdu, PendingRequest, RequestQueue};
pub use transport::{ExceptionCode, NetworkTransport, RestartAction, SerialTransport};
