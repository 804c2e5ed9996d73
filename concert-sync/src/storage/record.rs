//! On-disk framing for event log records.
//!
//! ```text
//! ┌──────────┬──────────┬───────┬──────────────┬──────────────┐
//! │ len      │ checksum │ flags │ body         │ footer       │
//! │ u32 LE   │ u32 LE   │ u8    │ len-1 bytes  │ 16 bytes     │
//! └──────────┴──────────┴───────┴──────────────┴──────────────┘
//! ```
//!
//! - `len` covers `flags + body`
//! - `checksum` is FNV-1a over `flags + body`
//! - `flags` bit 0: body is LZ4 compressed (size-prepended block)
//! - `footer` is a constant marker; a record without it was cut short by a
//!   crash mid-write
//!
//! The body is the bincode encoding of a `SessionEvent`.

use crate::event::SessionEvent;

/// Fixed marker written after every record.
pub const RECORD_FOOTER: [u8; 16] = [
    0xE4, 0x73, 0xC0, 0x70, 0x65, 0xDA, 0x42, 0xBF, 0xA0, 0x60, 0x7C, 0x78, 0xE0, 0xDC, 0x47, 0xCF,
];

/// `len` + `checksum`
pub const HEADER_LEN: usize = 8;

/// Bytes a record occupies beyond its `flags + body`.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + RECORD_FOOTER.len();

const FLAG_LZ4: u8 = 0b0000_0001;

/// Why a record could not be read back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Fewer bytes than the header promises; only valid at the end of a file
    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("record footer missing")]
    BadFooter,
    #[error("record checksum mismatch")]
    ChecksumMismatch,
    #[error("record decompression failed: {0}")]
    Decompression(String),
    #[error("record body undecodable: {0}")]
    Decode(String),
    #[error("record encoding failed: {0}")]
    Encode(String),
}

/// FNV-1a, 32 bit.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Encode an event as a complete framed record.
pub fn encode_record(event: &SessionEvent, compress_threshold: usize) -> Result<Vec<u8>, RecordError> {
    let raw = event.encode().map_err(|e| RecordError::Encode(e.to_string()))?;

    let (flags, body) = if raw.len() > compress_threshold {
        (FLAG_LZ4, lz4_flex::compress_prepend_size(&raw))
    } else {
        (0, raw)
    };

    let len = u32::try_from(body.len() + 1)
        .map_err(|_| RecordError::Encode(format!("record body too large: {} bytes", body.len())))?;

    let mut framed = Vec::with_capacity(FRAME_OVERHEAD + 1 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&[0u8; 4]);
    framed.push(flags);
    framed.extend_from_slice(&body);
    let sum = checksum(&framed[HEADER_LEN..]);
    framed[4..8].copy_from_slice(&sum.to_le_bytes());
    framed.extend_from_slice(&RECORD_FOOTER);
    Ok(framed)
}

/// Total framed size of the record whose header starts at `bytes[0]`.
pub fn framed_len(bytes: &[u8]) -> Result<usize, RecordError> {
    if bytes.len() < HEADER_LEN {
        return Err(RecordError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    Ok(FRAME_OVERHEAD + len)
}

/// Framed size of the record at `bytes[0]`, if its length is non-zero, fits
/// in `bytes` and lands exactly on a footer.
///
/// A length that fails this check cannot be used to find the next record.
/// The checksum is not verified here.
pub fn complete_frame_len(bytes: &[u8]) -> Option<usize> {
    let total = framed_len(bytes).ok()?;
    if total == FRAME_OVERHEAD || total > bytes.len() {
        return None;
    }
    (bytes[total - RECORD_FOOTER.len()..total] == RECORD_FOOTER).then_some(total)
}

/// Offset just past the first footer in `bytes`.
pub fn find_footer_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(RECORD_FOOTER.len())
        .position(|window| window == RECORD_FOOTER)
        .map(|start| start + RECORD_FOOTER.len())
}

/// Decode one framed record (exactly `framed_len` bytes).
pub fn decode_record(bytes: &[u8]) -> Result<SessionEvent, RecordError> {
    let total = framed_len(bytes)?;
    if bytes.len() < total {
        return Err(RecordError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let content = &bytes[HEADER_LEN..total - RECORD_FOOTER.len()];
    if bytes[total - RECORD_FOOTER.len()..total] != RECORD_FOOTER {
        return Err(RecordError::BadFooter);
    }
    let stored = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if checksum(content) != stored {
        return Err(RecordError::ChecksumMismatch);
    }
    let Some((&flags, body)) = content.split_first() else {
        return Err(RecordError::Decode("empty record".into()));
    };

    let raw = if flags & FLAG_LZ4 != 0 {
        lz4_flex::decompress_size_prepended(body)
            .map_err(|e| RecordError::Decompression(e.to_string()))?
    } else {
        body.to_vec()
    };
    SessionEvent::decode(&raw).map_err(|e| RecordError::Decode(e.to_string()))
}
