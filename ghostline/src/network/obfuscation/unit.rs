// Copyright (c) 2024 Botho Foundation

//! Wire format of one obfuscated unit.
//!
//! ```text
//! ┌────────────────────────┬─────┬────────────┬──────────────────┬───────────────┐
//! │ header (H random bytes)│ tag │ length (4) │ payload          │ random footer │
//! └────────────────────────┴─────┴────────────┴──────────────────┴───────────────┘
//!                                              └──────── length bytes ─────────┘
//! ```
//!
//! - `H` is selected by the first header byte:
//!   `min_header_len + header[0] % (max_header_len - min_header_len + 1)`.
//! - `tag` and `length` are XOR-masked with the last five header bytes so no
//!   byte value sits at a fixed offset.
//! - `length` is big-endian and covers payload and footer. The payload is a
//!   self-delimiting serialized envelope, so the footer is skipped using the
//!   length alone.
//! - The total unit size is drawn uniformly from
//!   `min_unit_size..=max_unit_size`, raised only as far as the payload
//!   requires.

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use thiserror::Error;

/// Tag byte length.
pub const TAG_LEN: usize = 1;

/// Length field size in bytes (u32 big-endian).
pub const LENGTH_FIELD_LEN: usize = 4;

/// Header bytes consumed by the tag and length mask.
const MASK_LEN: usize = TAG_LEN + LENGTH_FIELD_LEN;

/// Smallest header able to hold the selector byte and the mask.
pub const MIN_HEADER_LEN: usize = MASK_LEN + 1;

pub const DEFAULT_MIN_UNIT_SIZE: usize = 128;
pub const DEFAULT_MAX_UNIT_SIZE: usize = 8192;
pub const DEFAULT_MIN_HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_HEADER_LEN: usize = 64;

/// Declared bodies above this close the connection.
pub const DEFAULT_MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// Errors from wrapping or unwrapping units.
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared body length over the limit; fatal to the connection.
    #[error("unit body of {declared} bytes exceeds limit of {max}")]
    Oversized { declared: usize, max: usize },

    /// The unit carried something that is not a valid envelope.
    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("envelope serialization failed: {0}")]
    Serialize(String),
}

/// Size policy for units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeConfig {
    pub min_unit_size: usize,
    pub max_unit_size: usize,
    pub min_header_len: usize,
    pub max_header_len: usize,
    pub max_body_len: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            min_unit_size: DEFAULT_MIN_UNIT_SIZE,
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
            min_header_len: DEFAULT_MIN_HEADER_LEN,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

impl ShapeConfig {
    /// Copy with bounds put in order and headers large enough for the mask.
    pub fn normalized(&self) -> Self {
        let min_header_len = self.min_header_len.clamp(MIN_HEADER_LEN, 255);
        let max_header_len = self.max_header_len.clamp(min_header_len, 255 + min_header_len);
        Self {
            min_unit_size: self.min_unit_size.min(self.max_unit_size),
            max_unit_size: self.min_unit_size.max(self.max_unit_size),
            min_header_len,
            max_header_len,
            max_body_len: self.max_body_len,
        }
    }

    fn header_len(&self, selector: u8) -> usize {
        let span = self.max_header_len - self.min_header_len + 1;
        self.min_header_len + selector as usize % span
    }
}

/// Append one unit carrying `payload` to `dst`.
///
/// `shape` must be [normalized](ShapeConfig::normalized).
pub(crate) fn encode_unit<R: Rng>(
    shape: &ShapeConfig,
    tag: u8,
    payload: &[u8],
    rng: &mut R,
    dst: &mut BytesMut,
) -> Result<(), ObfuscationError> {
    let selector: u8 = rng.gen();
    let header_len = shape.header_len(selector);

    let fixed = header_len + MASK_LEN;
    let needed = fixed + payload.len();
    let low = shape.min_unit_size.max(needed);
    let high = shape.max_unit_size.max(low);
    let total = rng.gen_range(low..=high);

    let body_len = total - fixed;
    if body_len > shape.max_body_len || body_len > u32::MAX as usize {
        return Err(ObfuscationError::Oversized {
            declared: body_len,
            max: shape.max_body_len,
        });
    }

    dst.reserve(total);

    let mut header = vec![0u8; header_len];
    rng.fill(&mut header[..]);
    header[0] = selector;
    let mask = &header[header_len - MASK_LEN..];

    let length = (body_len as u32).to_be_bytes();
    let masked_tag = tag ^ mask[0];
    let mut masked_length = [0u8; LENGTH_FIELD_LEN];
    for (i, byte) in masked_length.iter_mut().enumerate() {
        *byte = length[i] ^ mask[1 + i];
    }

    dst.put_slice(&header);
    dst.put_u8(masked_tag);
    dst.put_slice(&masked_length);
    dst.put_slice(payload);

    let footer_start = dst.len();
    dst.resize(footer_start + (body_len - payload.len()), 0);
    rng.fill(&mut dst[footer_start..]);

    Ok(())
}

/// Split the next complete unit off the front of `src`.
///
/// Returns `Ok(None)` until a whole unit is buffered. The returned body
/// holds payload and footer.
pub(crate) fn decode_unit(
    shape: &ShapeConfig,
    src: &mut BytesMut,
) -> Result<Option<(u8, BytesMut)>, ObfuscationError> {
    let Some(&selector) = src.first() else {
        return Ok(None);
    };
    let header_len = shape.header_len(selector);
    let fixed = header_len + MASK_LEN;
    if src.len() < fixed {
        src.reserve(fixed - src.len());
        return Ok(None);
    }

    let mask = &src[header_len - MASK_LEN..header_len];
    let tag = src[header_len] ^ mask[0];
    let mut length = [0u8; LENGTH_FIELD_LEN];
    for (i, byte) in length.iter_mut().enumerate() {
        *byte = src[header_len + TAG_LEN + i] ^ mask[1 + i];
    }
    let body_len = u32::from_be_bytes(length) as usize;

    if body_len > shape.max_body_len {
        return Err(ObfuscationError::Oversized {
            declared: body_len,
            max: shape.max_body_len,
        });
    }

    if src.len() < fixed + body_len {
        src.reserve(fixed + body_len - src.len());
        return Ok(None);
    }

    src.advance(fixed);
    let body = src.split_to(body_len);
    Ok(Some((tag, body)))
}
