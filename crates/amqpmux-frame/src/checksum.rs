//! Size- and CRC-prefixed message bodies.
//!
//! Independent of the frame codec, a body can be wrapped in a small
//! self-describing envelope so the receiving side can prove the bytes
//! survived the trip through publish, framing, and reassembly unchanged.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┐
//! │ Size (4B BE) │ CRC32 (4B BE)│ Body (Size bytes)│
//! └──────────────┴──────────────┴──────────────────┘
//! ```
//!
//! The checksum is the standard CRC-32 (IEEE) over the body only.

use bytes::{BufMut, Bytes, BytesMut};

/// Envelope header: size (4) + checksum (4) = 8 bytes.
pub const CHECKSUM_HEADER_SIZE: usize = 8;

/// Verification failures for a checksum envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    /// Fewer bytes than the envelope header itself.
    #[error("envelope truncated ({len} bytes, header needs {CHECKSUM_HEADER_SIZE})")]
    Truncated { len: usize },

    /// The body is too large for the 32-bit size field.
    #[error("body too large for checksum envelope ({len} bytes)")]
    TooLarge { len: usize },

    /// Declared size disagrees with the bytes that followed the header.
    #[error("size mismatch: declared {declared}, actual {actual}")]
    Size { declared: u32, actual: usize },

    /// Stored checksum disagrees with the recomputed one.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },

    /// Both checks failed.
    #[error(
        "size and checksum mismatch: declared {declared}, actual {actual}, \
         stored {stored:#010x}, computed {computed:#010x}"
    )]
    SizeAndChecksum {
        declared: u32,
        actual: usize,
        stored: u32,
        computed: u32,
    },
}

/// Prefix `body` with its size and CRC-32.
pub fn tag(body: &[u8]) -> Result<Bytes, ChecksumError> {
    let size = u32::try_from(body.len()).map_err(|_| ChecksumError::TooLarge { len: body.len() })?;
    let mut out = BytesMut::with_capacity(CHECKSUM_HEADER_SIZE + body.len());
    out.put_u32(size);
    out.put_u32(crc32fast::hash(body));
    out.put_slice(body);
    Ok(out.freeze())
}

/// Check an envelope produced by [`tag`] and return the body on success.
///
/// The size and the checksum are checked independently; the error names
/// every check that failed.
pub fn verify(envelope: &[u8]) -> Result<&[u8], ChecksumError> {
    let (declared, stored) = envelope_header(envelope).ok_or(ChecksumError::Truncated {
        len: envelope.len(),
    })?;
    let body = &envelope[CHECKSUM_HEADER_SIZE..];

    let computed = crc32fast::hash(body);
    let actual = body.len();
    let size_ok = declared as usize == actual;
    let checksum_ok = stored == computed;

    match (size_ok, checksum_ok) {
        (true, true) => Ok(body),
        (false, true) => Err(ChecksumError::Size { declared, actual }),
        (true, false) => Err(ChecksumError::Checksum { stored, computed }),
        (false, false) => Err(ChecksumError::SizeAndChecksum {
            declared,
            actual,
            stored,
            computed,
        }),
    }
}

/// Declared size and stored CRC-32 of an envelope, without checking either.
pub fn envelope_header(envelope: &[u8]) -> Option<(u32, u32)> {
    let header = envelope.get(..CHECKSUM_HEADER_SIZE)?;
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let stored = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Some((declared, stored))
}

/// A tagged envelope around `size` random bytes from the OS RNG.
///
/// Used to produce payloads whose integrity can be checked after a round
/// trip through a broker.
pub fn random_tagged(size: usize) -> std::io::Result<Bytes> {
    let mut body = vec![0u8; size];
    getrandom::getrandom(&mut body)
        .map_err(|err| std::io::Error::other(format!("generate random body: {err}")))?;
    tag(&body).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
}
