//! The typed request/response envelope consumed by the store's event loop,
//! plus the variable-length offset encoding carried in `Get` requests and
//! successful replies.
//!
//! Offsets travel as Base-128 varints over the zigzag-mapped signed value:
//! the i64 is folded so small magnitudes stay small, then split into 7-bit
//! chunks, least significant first, with the high bit marking continuation.

use tokio::sync::oneshot;

use crate::error::{StoreError, StoreResult};

/// Kinds of events understood by the store's consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Get,
    Response,
    FlushMetaData,
    Terminate,
}

/// The envelope moved through the store's inbound queue and reply carriers.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    /// Opaque bytes: the payload for `Put`, the varint-encoded offset for
    /// `Get` requests and successful `Put` replies, the payload again for
    /// `Get` replies, unused otherwise.
    pub data: Vec<u8>,
    /// One-shot reply carrier, consumed by exactly one `Response`.
    pub reply: Option<oneshot::Sender<Event>>,
    /// Present only on `Response` events that report a failure.
    pub error: Option<StoreError>,
}

impl Event {
    pub fn put(payload: Vec<u8>, reply: oneshot::Sender<Event>) -> Self {
        Event {
            kind: EventKind::Put,
            data: payload,
            reply: Some(reply),
            error: None,
        }
    }

    pub fn get(offset: u64, reply: oneshot::Sender<Event>) -> Self {
        Event {
            kind: EventKind::Get,
            data: encode_offset(offset),
            reply: Some(reply),
            error: None,
        }
    }

    pub fn flush_metadata() -> Self {
        Event {
            kind: EventKind::FlushMetaData,
            data: Vec::new(),
            reply: None,
            error: None,
        }
    }

    pub fn terminate() -> Self {
        Event {
            kind: EventKind::Terminate,
            data: Vec::new(),
            reply: None,
            error: None,
        }
    }

    pub(crate) fn response_ok(data: Vec<u8>) -> Self {
        Event {
            kind: EventKind::Response,
            data,
            reply: None,
            error: None,
        }
    }

    pub(crate) fn response_err(error: StoreError) -> Self {
        Event {
            kind: EventKind::Response,
            data: Vec::new(),
            reply: None,
            error: Some(error),
        }
    }
}

/// Encodes an offset as a zigzag Base-128 varint.
pub fn encode_offset(offset: u64) -> Vec<u8> {
    let signed = offset as i64;
    let mut value = ((signed << 1) ^ (signed >> 63)) as u64;
    let mut out = Vec::with_capacity(10);
    loop {
        if value < 0x80 {
            out.push(value as u8);
            break;
        }
        out.push(((value & 0x7f) | 0x80) as u8);
        value >>= 7;
    }
    out
}

/// Decodes an offset from a zigzag Base-128 varint. The whole input must be
/// consumed; trailing bytes, truncation, and negative values are rejected.
pub fn decode_offset(data: &[u8]) -> StoreResult<u64> {
    let mut raw: u64 = 0;
    let mut shift: u32 = 0;
    for (i, byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(StoreError::InvalidOffsetEncoding(
                "varint wider than 64 bits".to_string(),
            ));
        }
        raw |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if i + 1 != data.len() {
                return Err(StoreError::InvalidOffsetEncoding(format!(
                    "{} trailing bytes after varint",
                    data.len() - i - 1
                )));
            }
            let signed = ((raw >> 1) as i64) ^ -((raw & 1) as i64);
            if signed < 0 {
                return Err(StoreError::InvalidOffsetEncoding(format!(
                    "negative offset {}",
                    signed
                )));
            }
            return Ok(signed as u64);
        }
        shift += 7;
    }
    Err(StoreError::InvalidOffsetEncoding(
        "truncated varint".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_roundtrip() {
        for offset in [0u64, 1, 2, 63, 64, 127, 128, 300, 4096, u32::MAX as u64, 1 << 40] {
            let encoded = encode_offset(offset);
            assert_eq!(
                decode_offset(&encoded).expect("roundtrip decode"),
                offset,
                "offset {}",
                offset
            );
        }
    }

    #[test]
    fn test_small_offsets_encode_to_one_byte() {
        // zigzag doubles the magnitude, so offsets below 64 stay single-byte
        assert_eq!(encode_offset(1), vec![0x02]);
        assert_eq!(encode_offset(63), vec![0x7e]);
        assert_eq!(encode_offset(64).len(), 2);
    }

    #[test]
    fn test_truncated_varint_rejected() {
        assert!(matches!(
            decode_offset(&[0x80]),
            Err(StoreError::InvalidOffsetEncoding(_))
        ));
        assert!(matches!(
            decode_offset(&[]),
            Err(StoreError::InvalidOffsetEncoding(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = encode_offset(7);
        encoded.push(0x00);
        assert!(matches!(
            decode_offset(&encoded),
            Err(StoreError::InvalidOffsetEncoding(_))
        ));
    }

    #[test]
    fn test_negative_offset_rejected() {
        // zigzag 0x01 is -1
        assert!(matches!(
            decode_offset(&[0x01]),
            Err(StoreError::InvalidOffsetEncoding(_))
        ));
    }
}
