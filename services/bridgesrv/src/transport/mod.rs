//! Transport seams of the bridge engine
//!
//! The engine never touches sockets or serial ports. It talks to two
//! injected transports through the traits below and learns about traffic by
//! draining events from them once per tick.
//!
//! ```text
//!   Modbus TCP clients                         RTU devices
//!          │                                        ▲
//!          ▼                                        │
//! ┌──────────────────┐   NetworkEvent   ┌───────────────────┐
//! │ NetworkTransport │ ───────────────► │                   │
//! │  (TCP server)    │ ◄─────────────── │   Bridge engine   │
//! └──────────────────┘   replies        │                   │
//! ┌──────────────────┐   SerialFrame    │                   │
//! │ SerialTransport  │ ───────────────► │                   │
//! │  (RTU master)    │ ◄─────────────── │                   │
//! └──────────────────┘   requests       └───────────────────┘
//! ```

pub mod mock;

use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

// ============================================================================
// Exception codes
// ============================================================================

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    /// Gateway could not accept the request (queue full)
    GatewayPathUnavailable = 0x0A,
    /// Gateway target did not answer, or answered with an unusable frame
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Wire value
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailedToRespond => "gateway target failed to respond",
        };
        write!(f, "0x{:02X} ({})", self.code(), name)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Metadata of a request received from a network peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFrameMeta {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub peer: SocketAddr,
}

/// Events produced by the network transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A complete Modbus request (PDU without MBAP header)
    Request { pdu: Bytes, meta: NetworkFrameMeta },
    PeerConnected(SocketAddr),
    /// `None` when the transport could not tell which peer left
    PeerDisconnected(Option<SocketAddr>),
}

/// Direction of an RTU frame as classified by the serial transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Addressed to a server device (a request, or an echo of ours)
    Request,
    /// Sent by a server device
    Response,
}

/// Metadata of a frame received on the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFrameMeta {
    /// Unit id as declared by the first byte of the frame
    pub unit_id: u8,
    pub direction: Direction,
    /// CRC and framing checks passed
    pub valid: bool,
}

/// Frame received on the serial line, PDU without address and CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub pdu: Bytes,
    pub meta: SerialFrameMeta,
}

// ============================================================================
// Transport traits
// ============================================================================

/// Modbus TCP server side
pub trait NetworkTransport {
    /// Move every event received since the last call into `events`
    fn poll_events(&mut self, events: &mut Vec<NetworkEvent>);

    /// Transaction id stamped on the next reply
    fn set_pending_transaction_id(&mut self, transaction_id: u16);

    /// Send an exception reply for `function_code` to `peer`
    fn send_error_reply(
        &mut self,
        peer: SocketAddr,
        function_code: u8,
        exception: ExceptionCode,
        unit_id: u8,
    ) -> bool;

    /// Send a reply PDU to `peer`, unmodified apart from the MBAP header
    fn send_raw_reply(&mut self, peer: SocketAddr, pdu: &[u8], unit_id: u8) -> bool;
}

/// Modbus RTU master side
pub trait SerialTransport {
    /// Move every frame received since the last call into `frames`
    fn poll_frames(&mut self, frames: &mut Vec<SerialFrame>);

    /// Start a transmission; `false` when the line cannot take it right now
    fn send_raw_request(&mut self, unit_id: u8, pdu: &[u8]) -> bool;
}

/// Invoked once when the queue watchdog expires
pub trait RestartAction {
    fn request_restart(&mut self, stuck_for: Duration);
}

impl<F> RestartAction for F
where
    F: FnMut(Duration),
{
    fn request_restart(&mut self, stuck_for: Duration) {
        self(stuck_for)
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Monotonic time source of the engine
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time, so a test can keep one handle and give the
/// other to the engine.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}
