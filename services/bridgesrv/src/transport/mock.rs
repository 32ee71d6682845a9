//! In-memory transports for driving the engine without sockets or serial ports

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;

use super::{
    Direction, ExceptionCode, NetworkEvent, NetworkFrameMeta, NetworkTransport, SerialFrame,
    SerialFrameMeta, SerialTransport,
};

/// Reply recorded by [`MockNetwork`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentReply {
    Error {
        peer: SocketAddr,
        transaction_id: u16,
        function_code: u8,
        exception: ExceptionCode,
        unit_id: u8,
    },
    Raw {
        peer: SocketAddr,
        transaction_id: u16,
        pdu: Vec<u8>,
        unit_id: u8,
    },
}

impl SentReply {
    pub fn transaction_id(&self) -> u16 {
        match self {
            Self::Error { transaction_id, .. } | Self::Raw { transaction_id, .. } => {
                *transaction_id
            },
        }
    }

    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Error { peer, .. } | Self::Raw { peer, .. } => *peer,
        }
    }
}

/// Scripted network side
#[derive(Debug, Default)]
pub struct MockNetwork {
    inbox: VecDeque<NetworkEvent>,
    pending_transaction_id: u16,
    replies: Vec<SentReply>,
    fail_replies: bool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request to be delivered on the next poll
    pub fn push_request(&mut self, peer: SocketAddr, unit_id: u8, transaction_id: u16, pdu: &[u8]) {
        self.inbox.push_back(NetworkEvent::Request {
            pdu: Bytes::copy_from_slice(pdu),
            meta: NetworkFrameMeta {
                unit_id,
                transaction_id,
                peer,
            },
        });
    }

    pub fn push_event(&mut self, event: NetworkEvent) {
        self.inbox.push_back(event);
    }

    /// Replies sent so far, oldest first
    pub fn replies(&self) -> &[SentReply] {
        &self.replies
    }

    pub fn take_replies(&mut self) -> Vec<SentReply> {
        std::mem::take(&mut self.replies)
    }

    /// Make every following send report failure
    pub fn set_reply_failure(&mut self, fail: bool) {
        self.fail_replies = fail;
    }
}

impl NetworkTransport for MockNetwork {
    fn poll_events(&mut self, events: &mut Vec<NetworkEvent>) {
        events.extend(self.inbox.drain(..));
    }

    fn set_pending_transaction_id(&mut self, transaction_id: u16) {
        self.pending_transaction_id = transaction_id;
    }

    fn send_error_reply(
        &mut self,
        peer: SocketAddr,
        function_code: u8,
        exception: ExceptionCode,
        unit_id: u8,
    ) -> bool {
        if self.fail_replies {
            return false;
        }
        self.replies.push(SentReply::Error {
            peer,
            transaction_id: self.pending_transaction_id,
            function_code,
            exception,
            unit_id,
        });
        true
    }

    fn send_raw_reply(&mut self, peer: SocketAddr, pdu: &[u8], unit_id: u8) -> bool {
        if self.fail_replies {
            return false;
        }
        self.replies.push(SentReply::Raw {
            peer,
            transaction_id: self.pending_transaction_id,
            pdu: pdu.to_vec(),
            unit_id,
        });
        true
    }
}

/// Scripted serial side
#[derive(Debug, Default)]
pub struct MockSerial {
    inbox: VecDeque<SerialFrame>,
    sent: Vec<(u8, Vec<u8>)>,
    refuse_sends: bool,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device response to be delivered on the next poll
    pub fn push_response(&mut self, unit_id: u8, pdu: &[u8], valid: bool) {
        self.push_frame(SerialFrame {
            pdu: Bytes::copy_from_slice(pdu),
            meta: SerialFrameMeta {
                unit_id,
                direction: Direction::Response,
                valid,
            },
        });
    }

    pub fn push_frame(&mut self, frame: SerialFrame) {
        self.inbox.push_back(frame);
    }

    /// Requests transmitted so far as `(unit_id, pdu)`
    pub fn sent(&self) -> &[(u8, Vec<u8>)] {
        &self.sent
    }

    /// Make every following send report failure
    pub fn set_send_failure(&mut self, refuse: bool) {
        self.refuse_sends = refuse;
    }
}

impl SerialTransport for MockSerial {
    fn poll_frames(&mut self, frames: &mut Vec<SerialFrame>) {
        frames.extend(self.inbox.drain(..));
    }

    fn send_raw_request(&mut self, unit_id: u8, pdu: &[u8]) -> bool {
        if self.refuse_sends {
            return false;
        }
        self.sent.push((unit_id, pdu.to_vec()));
        true
    }
}
