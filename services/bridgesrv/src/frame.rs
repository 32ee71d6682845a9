//! Modbus frame processing
//!
//! MBAP framing for the TCP side (as a `tokio_util` codec) and RTU framing
//! with CRC-16/MODBUS for the serial side.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use errors::{frame_error, BridgeError};
use tokio_util::codec::{Decoder, Encoder};

/// Largest Modbus PDU (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length, unit id included
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest value of the MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = MAX_PDU_SIZE + 1;

/// Smallest well-formed RTU frame: address + function code + CRC
pub const RTU_MIN_FRAME_LEN: usize = 4;

/// Largest RTU frame: address + PDU + CRC
pub const MAX_RTU_FRAME_LEN: usize = MAX_PDU_SIZE + 3;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Exception PDU answering `function_code`
pub fn exception_pdu(function_code: u8, exception_code: u8) -> [u8; 2] {
    [function_code | EXCEPTION_FLAG, exception_code]
}

// ============================================================================
// MBAP (TCP)
// ============================================================================

/// MBAP (Modbus Application Protocol) header for TCP mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16, // Always 0 for Modbus
    pub length: u16,      // Byte count of following fields
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    /// Parse the fixed 7-byte header; `None` while incomplete
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }

    /// Total frame length including the header
    pub fn frame_length(&self) -> usize {
        MBAP_HEADER_LEN + self.length as usize - 1
    }
}

/// One Modbus TCP ADU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
}

/// Codec for MBAP framed streams
///
/// A wrong protocol id or an impossible length is a fatal stream error: the
/// byte stream cannot be resynchronized after it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = MbapHeader::parse(src) else {
            return Ok(None);
        };

        if header.protocol_id != 0 {
            return Err(frame_error!("invalid protocol id {}", header.protocol_id));
        }
        let length = header.length as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(frame_error!("invalid MBAP length {}", length));
        }

        let total = header.frame_length();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(MBAP_HEADER_LEN);
        Ok(Some(MbapFrame {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu: frame.freeze(),
        }))
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: MbapFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.pdu.is_empty() || item.pdu.len() > MAX_PDU_SIZE {
            return Err(frame_error!("cannot encode a {} byte PDU", item.pdu.len()));
        }
        let header = MbapHeader::new(item.transaction_id, item.unit_id, item.pdu.len() as u16);
        dst.reserve(header.frame_length());
        header.write_to(dst);
        dst.put_slice(&item.pdu);
        Ok(())
    }
}

// ============================================================================
// RTU (serial)
// ============================================================================

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Build an RTU ADU: address, PDU, CRC (little-endian)
pub fn encode_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 3);
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

/// RTU frame split into its fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: Bytes,
    pub crc_ok: bool,
}

impl RtuFrame {
    /// Split raw bytes delimited by bus silence
    ///
    /// Frames shorter than [`RTU_MIN_FRAME_LEN`] are kept with `crc_ok ==
    /// false` and everything after the first byte as PDU, so that a caller can
    /// still attempt a repair.
    pub fn split(raw: &[u8]) -> Self {
        if raw.len() < RTU_MIN_FRAME_LEN {
            return Self {
                unit_id: raw.first().copied().unwrap_or(0),
                pdu: Bytes::copy_from_slice(raw.get(1..).unwrap_or(&[])),
                crc_ok: false,
            };
        }

        let (body, crc) = raw.split_at(raw.len() - 2);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        Self {
            unit_id: body[0],
            pdu: Bytes::copy_from_slice(&body[1..]),
            crc_ok: crc16(body) == received,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_crc_reference_vector() {
        let adu = encode_rtu_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(adu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_rtu_split_valid() {
        let adu = encode_rtu_frame(0x11, &[0x03, 0x02, 0x00, 0x2A]);
        let frame = RtuFrame::split(&adu);
        assert!(frame.crc_ok);
        assert_eq!(frame.unit_id, 0x11);
        assert_eq!(&frame.pdu[..], &[0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_rtu_split_bad_crc() {
        let mut adu = encode_rtu_frame(0x11, &[0x03, 0x02, 0x00, 0x2A]);
        let last = adu.len() - 1;
        adu[last] ^= 0xFF;
        let frame = RtuFrame::split(&adu);
        assert!(!frame.crc_ok);
        assert_eq!(frame.unit_id, 0x11);
    }

    #[test]
    fn test_rtu_split_short_frame() {
        let frame = RtuFrame::split(&[0x05, 0x90, 0x83]);
        assert!(!frame.crc_ok);
        assert_eq!(frame.unit_id, 0x05);
        assert_eq!(&frame.pdu[..], &[0x90, 0x83]);

        let empty = RtuFrame::split(&[]);
        assert!(empty.pdu.is_empty());
    }

    #[test]
    fn test_exception_pdu() {
        assert_eq!(exception_pdu(0x03, 0x0B), [0x83, 0x0B]);
    }

    #[test]
    fn test_mbap_decode_partial_then_complete() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.transaction_id, 7);
        assert_eq!(frame.unit_id, 1);
        assert_eq!(&frame.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mbap_decode_back_to_back_frames() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(
            &[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x07, // fc 07
                0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x02, 0x2B, 0x0E,
            ][..],
        );
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.transaction_id, 1);
        assert_eq!(&first.pdu[..], &[0x07]);
        assert_eq!(second.unit_id, 2);
        assert_eq!(&second.pdu[..], &[0x2B, 0x0E]);
    }

    #[test]
    fn test_mbap_decode_rejects_protocol_id() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03][..]);
        assert!(matches!(codec.decode(&mut buf), Err(BridgeError::Frame(_))));
    }

    #[test]
    fn test_mbap_decode_rejects_oversized_length() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_mbap_encode() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                MbapFrame {
                    transaction_id: 0x1234,
                    unit_id: 0x05,
                    pdu: Bytes::from_static(&[0x83, 0x0B]),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x05, 0x83, 0x0B]
        );
    }

    #[test]
    fn test_mbap_encode_rejects_empty_pdu() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        let frame = MbapFrame {
            transaction_id: 1,
            unit_id: 1,
            pdu: Bytes::new(),
        };
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
