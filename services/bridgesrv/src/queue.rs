//! Bounded FIFO of requests waiting for the RTU line
//!
//! Only the head can be in flight. The queue remembers when the head was
//! handed to the serial transport; that single timestamp is both the
//! in-progress flag and the origin of the response timeout.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use errors::{BridgeError, BridgeResult};
use thiserror::Error;

use crate::frame::MAX_PDU_SIZE;
use crate::transport::NetworkFrameMeta;

/// Default number of pending requests
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// Request PDU stored inline
#[derive(Clone, PartialEq, Eq)]
pub struct Pdu {
    buf: [u8; MAX_PDU_SIZE],
    len: u8,
}

impl Pdu {
    /// Copy `data` into a PDU; it must hold 1..=253 bytes
    pub fn new(data: &[u8]) -> BridgeResult<Self> {
        if data.is_empty() {
            return Err(BridgeError::EmptyPdu);
        }
        if data.len() > MAX_PDU_SIZE {
            return Err(BridgeError::PduTooLarge {
                len: data.len(),
                max: MAX_PDU_SIZE,
            });
        }
        let mut buf = [0u8; MAX_PDU_SIZE];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            buf,
            len: data.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn function_code(&self) -> u8 {
        self.buf[0]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pdu[{}]", common::hex::encode_upper(self.as_bytes()))
    }
}

/// A network request waiting for, or occupying, the RTU line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// RTU unit (slave) address
    pub unit_id: u8,
    /// MBAP transaction id, echoed in the reply
    pub transaction_id: u16,
    /// Peer that sent the request
    pub peer: SocketAddr,
    pub pdu: Pdu,
}

impl PendingRequest {
    pub fn new(meta: &NetworkFrameMeta, pdu: &[u8]) -> BridgeResult<Self> {
        Ok(Self {
            unit_id: meta.unit_id,
            transaction_id: meta.transaction_id,
            peer: meta.peer,
            pdu: Pdu::new(pdu)?,
        })
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }
}

/// Rejected push; the request is handed back so it can be answered
#[derive(Debug, Error)]
#[error("request queue full ({capacity} pending)")]
pub struct QueueFull {
    pub request: PendingRequest,
    pub capacity: usize,
}

/// Bounded FIFO with single in-flight head
#[derive(Debug)]
pub struct RequestQueue {
    items: VecDeque<PendingRequest>,
    capacity: usize,
    head_started_at: Option<Instant>,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> BridgeResult<Self> {
        if capacity == 0 {
            return Err(BridgeError::InvalidConfig {
                field: "bridge.queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            head_started_at: None,
        })
    }

    /// Append at the tail; rejected when `capacity` requests are pending
    pub fn push(&mut self, request: PendingRequest) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull {
                request,
                capacity: self.capacity,
            });
        }
        self.items.push_back(request);
        Ok(())
    }

    pub fn peek(&self) -> Option<&PendingRequest> {
        self.items.front()
    }

    /// Remove the head and clear the in-progress mark
    pub fn dequeue_head(&mut self) -> Option<PendingRequest> {
        self.head_started_at = None;
        self.items.pop_front()
    }

    /// Record that the head was handed to the serial line at `now`
    pub fn mark_head_in_progress(&mut self, now: Instant) {
        if !self.items.is_empty() {
            self.head_started_at = Some(now);
        }
    }

    pub fn is_head_in_progress(&self) -> bool {
        self.head_started_at.is_some()
    }

    /// Time since the head was dispatched, `None` when idle
    pub fn head_elapsed(&self, now: Instant) -> Option<Duration> {
        self.head_started_at
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.items.iter()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn request(transaction_id: u16) -> PendingRequest {
        let meta = NetworkFrameMeta {
            unit_id: 1,
            transaction_id,
            peer: "127.0.0.1:40000".parse().unwrap(),
        };
        PendingRequest::new(&meta, &[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap()
    }

    #[test]
    fn test_pdu_bounds() {
        assert!(matches!(Pdu::new(&[]), Err(BridgeError::EmptyPdu)));
        assert!(Pdu::new(&[0u8; MAX_PDU_SIZE]).is_ok());
        assert!(matches!(
            Pdu::new(&[0u8; MAX_PDU_SIZE + 1]),
            Err(BridgeError::PduTooLarge { len: 254, max: 253 })
        ));
    }

    #[test]
    fn test_pdu_accessors() {
        let pdu = Pdu::new(&[0x10, 0xAB]).unwrap();
        assert_eq!(pdu.function_code(), 0x10);
        assert_eq!(pdu.as_bytes(), &[0x10, 0xAB]);
        assert_eq!(pdu.len(), 2);
        assert_eq!(format!("{:?}", pdu), "Pdu[10AB]");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(RequestQueue::new(0).is_err());
    }

    #[test]
    fn test_fifo_order_and_capacity() {
        let mut queue = RequestQueue::new(2).unwrap();
        queue.push(request(1)).unwrap();
        queue.push(request(2)).unwrap();

        let rejected = queue.push(request(3)).unwrap_err();
        assert_eq!(rejected.request.transaction_id, 3);
        assert!(queue.is_full());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue_head().unwrap().transaction_id, 1);
        assert_eq!(queue.peek().unwrap().transaction_id, 2);
        queue.push(request(4)).unwrap();
        let order: Vec<u16> = queue.iter().map(|r| r.transaction_id).collect();
        assert_eq!(order, vec![2, 4]);
    }

    #[test]
    fn test_in_progress_tracking() {
        let mut queue = RequestQueue::new(4).unwrap();
        let start = Instant::now();

        queue.mark_head_in_progress(start);
        assert!(!queue.is_head_in_progress(), "empty queue has no head");

        queue.push(request(1)).unwrap();
        queue.push(request(2)).unwrap();
        assert_eq!(queue.head_elapsed(start), None);

        queue.mark_head_in_progress(start);
        assert_eq!(
            queue.head_elapsed(start + Duration::from_millis(120)),
            Some(Duration::from_millis(120))
        );

        queue.dequeue_head();
        assert!(!queue.is_head_in_progress());
        assert_eq!(queue.peek().unwrap().transaction_id, 2);
    }
}
