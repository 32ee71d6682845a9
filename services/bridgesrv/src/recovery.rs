//! Repair of RTU replies mangled by line noise
//!
//! Two corruptions are seen in the field:
//! - a stray byte in front of an `0x90`-prefixed exception, which the
//!   device meant as `0x83` (read holding registers exception)
//! - the unit address delivered twice, shifting the PDU by one byte
//!
//! Anything else is left alone and answered as a failed target.

use std::fmt;

/// First byte of the mangled exception reply
pub const NOISE_SENTINEL: u8 = 0x90;

/// Function code restored in place of [`NOISE_SENTINEL`]
pub const SENTINEL_REPLACEMENT: u8 = 0x83;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// `[.., 0x90, X]` rewritten to `[0x83, X]`
    SentinelException,
    /// `[unit, fc, ..]` shifted left by one byte
    DuplicatedAddress,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SentinelException => write!(f, "sentinel exception"),
            Self::DuplicatedAddress => write!(f, "duplicated address"),
        }
    }
}

/// Repaired reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFrame {
    pub kind: RecoveryKind,
    pub pdu: Vec<u8>,
}

/// Try to repair `pdu`, a reply to a request for `unit_id` / `function_code`
pub fn try_recover(pdu: &[u8], unit_id: u8, function_code: u8) -> Option<RecoveredFrame> {
    let mut data = pdu;

    // Leading noise byte in front of the sentinel
    if data.len() == 3 && data[1] == NOISE_SENTINEL {
        data = &data[1..];
    }

    if data.len() == 2 && data[0] == NOISE_SENTINEL {
        return Some(RecoveredFrame {
            kind: RecoveryKind::SentinelException,
            pdu: vec![SENTINEL_REPLACEMENT, data[1]],
        });
    }

    if data.len() >= 2 && data[0] == unit_id && data[1] == function_code {
        return Some(RecoveredFrame {
            kind: RecoveryKind::DuplicatedAddress,
            pdu: data[1..].to_vec(),
        });
    }

    None
}
