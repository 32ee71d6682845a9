//! Bridge engine
//!
//! Owns the request queue and moves every transaction through it:
//!
//! ```text
//!  network request ──► queued ──► dispatched ──► reply forwarded
//!         │                           │
//!         └─► 0x0A (queue full)       ├─► 0x0B (timeout)
//!                                     └─► 0x0B (unusable reply)
//! ```
//!
//! All I/O goes through the injected transports. [`Bridge::task`] is
//! non-blocking and meant to be called on a fixed tick.

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::hex::{dump_frame, DEFAULT_DUMP_LIMIT};
use errors::BridgeResult;
use tracing::{debug, error, info, warn};

use crate::queue::{PendingRequest, QueueFull, RequestQueue, DEFAULT_QUEUE_CAPACITY};
use crate::recovery;
use crate::transport::{
    Clock, Direction, ExceptionCode, NetworkEvent, NetworkFrameMeta, NetworkTransport,
    RestartAction, SerialFrame, SerialFrameMeta, SerialTransport, SystemClock,
};
use crate::watchdog::{Watchdog, DEFAULT_WATCHDOG_TIMEOUT};

/// Default time a device gets to answer
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub queue_capacity: usize,
    pub response_timeout: Duration,
    pub watchdog_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
        }
    }
}

/// Monotonic engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub requests_received: u64,
    pub rejected_queue_full: u64,
    pub rejected_invalid: u64,
    pub dispatched: u64,
    pub send_failures: u64,
    pub replies_forwarded: u64,
    pub frames_recovered: u64,
    pub timeouts: u64,
    pub serial_failures: u64,
    pub ignored_frames: u64,
    pub reply_failures: u64,
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} rejected(full={}, invalid={}) dispatched={} send_failures={} \
             forwarded={} recovered={} timeouts={} serial_failures={} ignored={} \
             reply_failures={}",
            self.requests_received,
            self.rejected_queue_full,
            self.rejected_invalid,
            self.dispatched,
            self.send_failures,
            self.replies_forwarded,
            self.frames_recovered,
            self.timeouts,
            self.serial_failures,
            self.ignored_frames,
            self.reply_failures
        )
    }
}

/// Modbus TCP to RTU bridge engine
pub struct Bridge<N, S, R, C = SystemClock> {
    network: N,
    serial: S,
    restart: R,
    clock: C,
    settings: BridgeSettings,
    queue: RequestQueue,
    watchdog: Watchdog,
    stats: BridgeStats,
    // Reused between ticks
    network_events: Vec<NetworkEvent>,
    serial_frames: Vec<SerialFrame>,
}

impl<N, S, R, C> Bridge<N, S, R, C>
where
    N: NetworkTransport,
    S: SerialTransport,
    R: RestartAction,
    C: Clock,
{
    pub fn new(
        network: N,
        serial: S,
        restart: R,
        clock: C,
        settings: BridgeSettings,
    ) -> BridgeResult<Self> {
        let queue = RequestQueue::new(settings.queue_capacity)?;
        info!(
            "Bridge engine: queue {}, response timeout {} ms, watchdog {} ms",
            settings.queue_capacity,
            settings.response_timeout.as_millis(),
            settings.watchdog_timeout.as_millis()
        );
        Ok(Self {
            network,
            serial,
            restart,
            clock,
            settings,
            queue,
            watchdog: Watchdog::new(settings.watchdog_timeout),
            stats: BridgeStats::default(),
            network_events: Vec::new(),
            serial_frames: Vec::new(),
        })
    }

    /// One cooperative tick
    pub fn task(&mut self) {
        let mut frames = mem::take(&mut self.serial_frames);
        self.serial.poll_frames(&mut frames);
        for frame in frames.drain(..) {
            self.on_serial_raw(&frame.pdu, frame.meta);
        }
        self.serial_frames = frames;

        let mut events = mem::take(&mut self.network_events);
        self.network.poll_events(&mut events);
        for event in events.drain(..) {
            match event {
                NetworkEvent::Request { pdu, meta } => self.on_network_request(&pdu, meta),
                NetworkEvent::PeerConnected(peer) => self.on_peer_connected(peer),
                NetworkEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
            }
        }
        self.network_events = events;

        let now = self.clock.now();
        if let Some(stuck_for) = self.watchdog.observe(self.queue.is_empty(), now) {
            error!(
                "Queue watchdog: {} request(s) stuck for {} ms, requesting restart",
                self.queue.len(),
                stuck_for.as_millis()
            );
            self.restart.request_restart(stuck_for);
        }

        if !self.queue.is_empty() && !self.queue.is_head_in_progress() {
            self.dispatch_head(now);
        } else if let Some(elapsed) = self.queue.head_elapsed(now) {
            if elapsed > self.settings.response_timeout {
                self.timeout_head(elapsed);
            }
        }
    }

    /// Request received from a network peer
    pub fn on_network_request(&mut self, pdu: &[u8], meta: NetworkFrameMeta) {
        self.stats.requests_received += 1;

        let request = match PendingRequest::new(&meta, pdu) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "Rejected request from {} (transaction {}): {}",
                    meta.peer, meta.transaction_id, e
                );
                self.stats.rejected_invalid += 1;
                let function_code = pdu.first().copied().unwrap_or(0);
                self.emit_exception(
                    meta.peer,
                    meta.transaction_id,
                    meta.unit_id,
                    function_code,
                    ExceptionCode::IllegalDataValue,
                );
                return;
            },
        };

        match self.queue.push(request) {
            Ok(()) => {
                debug!(
                    "Request queued: unit {}, fn 0x{:02X}, len {}, transaction {} ({} pending)",
                    meta.unit_id,
                    pdu[0],
                    pdu.len(),
                    meta.transaction_id,
                    self.queue.len()
                );
            },
            Err(QueueFull { request, capacity }) => {
                warn!(
                    "Queue full ({}), rejecting transaction {} from {}",
                    capacity, request.transaction_id, request.peer
                );
                self.stats.rejected_queue_full += 1;
                self.send_error(&request, ExceptionCode::GatewayPathUnavailable);
            },
        }
    }

    /// Frame received on the serial line
    pub fn on_serial_raw(&mut self, pdu: &[u8], meta: SerialFrameMeta) {
        debug!(
            "RTU frame: unit {}, len {}, {:?}, valid {}",
            meta.unit_id,
            pdu.len(),
            meta.direction,
            meta.valid
        );

        if !self.queue.is_head_in_progress() {
            debug!("RTU frame from unit {} ignored: no request in flight", meta.unit_id);
            self.stats.ignored_frames += 1;
            return;
        }
        if meta.direction == Direction::Request {
            debug!("RTU frame to unit {} ignored: not a response", meta.unit_id);
            self.stats.ignored_frames += 1;
            return;
        }
        let Some(request) = self.queue.dequeue_head() else {
            return;
        };

        if meta.valid && meta.unit_id == request.unit_id {
            self.forward_reply(&request, pdu);
            return;
        }

        match recovery::try_recover(pdu, request.unit_id, request.function_code()) {
            Some(recovered) => {
                info!(
                    "Recovered {} reply for unit {} (transaction {})",
                    recovered.kind, request.unit_id, request.transaction_id
                );
                self.stats.frames_recovered += 1;
                self.forward_reply(&request, &recovered.pdu);
            },
            None => {
                warn!(
                    "Unusable reply for unit {} (declared unit {}, valid {}): {}",
                    request.unit_id,
                    meta.unit_id,
                    meta.valid,
                    dump_frame(pdu, DEFAULT_DUMP_LIMIT)
                );
                self.stats.serial_failures += 1;
                self.send_error(&request, ExceptionCode::GatewayTargetFailedToRespond);
            },
        }
    }

    pub fn on_peer_connected(&mut self, peer: SocketAddr) {
        info!("Client connected: {}", peer);
    }

    pub fn on_peer_disconnected(&mut self, peer: Option<SocketAddr>) {
        match peer {
            Some(peer) => info!("Client disconnected: {}", peer),
            None => info!("Client disconnected"),
        }
    }

    fn dispatch_head(&mut self, now: Instant) {
        let Some(head) = self.queue.peek() else {
            return;
        };
        let (unit_id, transaction_id) = (head.unit_id, head.transaction_id);

        if self.serial.send_raw_request(unit_id, head.pdu.as_bytes()) {
            self.queue.mark_head_in_progress(now);
            self.stats.dispatched += 1;
            debug!(
                "Dispatched transaction {} to unit {}",
                transaction_id, unit_id
            );
        } else {
            self.stats.send_failures += 1;
            debug!(
                "RTU send failed for transaction {}, retrying next tick",
                transaction_id
            );
        }
    }

    fn timeout_head(&mut self, elapsed: Duration) {
        let Some(request) = self.queue.dequeue_head() else {
            return;
        };
        warn!(
            "RTU timeout: unit {}, transaction {}, no reply after {} ms",
            request.unit_id,
            request.transaction_id,
            elapsed.as_millis()
        );
        self.stats.timeouts += 1;
        self.send_error(&request, ExceptionCode::GatewayTargetFailedToRespond);
    }

    fn forward_reply(&mut self, request: &PendingRequest, pdu: &[u8]) {
        self.network.set_pending_transaction_id(request.transaction_id);
        if self
            .network
            .send_raw_reply(request.peer, pdu, request.unit_id)
        {
            self.stats.replies_forwarded += 1;
            debug!(
                "Reply forwarded: unit {}, transaction {}, len {}",
                request.unit_id,
                request.transaction_id,
                pdu.len()
            );
        } else {
            self.stats.reply_failures += 1;
            warn!(
                "Failed to forward reply for transaction {} to {}",
                request.transaction_id, request.peer
            );
        }
    }

    fn send_error(&mut self, request: &PendingRequest, exception: ExceptionCode) {
        self.emit_exception(
            request.peer,
            request.transaction_id,
            request.unit_id,
            request.function_code(),
            exception,
        );
    }

    fn emit_exception(
        &mut self,
        peer: SocketAddr,
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
        exception: ExceptionCode,
    ) {
        self.network.set_pending_transaction_id(transaction_id);
        if self
            .network
            .send_error_reply(peer, function_code, exception, unit_id)
        {
            debug!(
                "Exception {} sent for transaction {}",
                exception, transaction_id
            );
        } else {
            self.stats.reply_failures += 1;
            warn!(
                "Failed to send exception {} for transaction {} to {}",
                exception, transaction_id, peer
            );
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn serial(&self) -> &S {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn restart_action(&self) -> &R {
        &self.restart
    }
}
