//! Characteristic value codec. Pure encode/decode routines for each wire
//! type used by the service ([MCS] Section 3). Decoders are length-strict and
//! return [`None`] for any payload that is not exactly the expected size;
//! encoders clamp out-of-range numeric values instead of failing.

use structbuf::{Unpack, Unpacker};

/// Wire value of an unknown track duration or position ([MCS] Section 3.5.1).
/// Encoded verbatim, bypassing the tenths-of-a-second conversion.
pub(crate) const UNKNOWN_INTERVAL: u32 = 0xFFFF_FFFF;

/// 48-bit Object Transfer Service object identifier
/// ([OTS] Section 3.2.1.2).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Largest valid object identifier.
    pub const MAX: Self = Self((1 << 48) - 1);

    /// Creates an object identifier, or returns [`None`] if `v` does not fit
    /// in 48 bits.
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Option<Self> {
        if v <= Self::MAX.0 {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Returns the raw identifier value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the 6-byte little-endian wire encoding.
    #[inline]
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 6] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2], b[3], b[4], b[5]]
    }
}

/// Encodes a UTF-8 string value. The length is implicit in the attribute
/// value length; there is no prefix or terminator.
#[inline]
#[must_use]
pub(crate) fn encode_utf8(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// Encodes a single-byte value.
#[inline]
#[must_use]
pub(crate) fn encode_u8(v: u8) -> [u8; 1] {
    [v]
}

/// Decodes a single-byte value.
#[inline]
#[must_use]
pub(crate) fn decode_u8(v: &[u8]) -> Option<u8> {
    Unpacker::new(v).map(|p| p.u8())
}

/// Encodes a track duration or position held in milliseconds as signed
/// tenths of a second. `None` encodes the unknown sentinel verbatim.
#[must_use]
pub(crate) fn encode_interval(ms: Option<i64>) -> [u8; 4] {
    match ms {
        None => UNKNOWN_INTERVAL.to_le_bytes(),
        #[allow(clippy::cast_possible_truncation)]
        Some(ms) => {
            let tenths = (ms / 10).clamp(i64::from(i32::MIN), i64::from(i32::MAX));
            (tenths as i32).to_le_bytes()
        }
    }
}

/// Decodes a signed tenths-of-a-second value into milliseconds.
#[inline]
#[must_use]
pub(crate) fn decode_interval(v: &[u8]) -> Option<i64> {
    Unpacker::new(v).map(|p| i64::from(p.i32()) * 10)
}

/// Encodes a playback or seeking speed as the signed 8-bit exponent `raw`
/// where `speed = 2^(raw / 64)` ([MCS] Section 3.8.1). Values outside the
/// representable range (including zero, negatives, and NaN) are clamped.
#[must_use]
pub(crate) fn encode_speed(v: f32) -> [u8; 1] {
    #[allow(clippy::cast_possible_truncation)]
    let raw = if v > 0.0 {
        (v.log2() * 64.0).round().clamp(f32::from(i8::MIN), f32::from(i8::MAX)) as i8
    } else {
        i8::MIN
    };
    [raw as u8]
}

/// Decodes a speed exponent into the factor `2^(raw / 64)`.
#[inline]
#[must_use]
pub(crate) fn decode_speed(v: &[u8]) -> Option<f32> {
    (Unpacker::new(v).map(|p| p.i8())).map(|raw| (f32::from(raw) / 64.0).exp2())
}

/// Encodes an optional object identifier. Absence is a zero-length value,
/// never a sentinel number.
#[inline]
#[must_use]
pub(crate) fn encode_object_id(id: Option<ObjectId>) -> Vec<u8> {
    id.map_or_else(Vec::new, |id| id.to_le_bytes().to_vec())
}

/// Decodes an object identifier. Exactly 6 bytes; anything else is an error,
/// never truncated or padded.
#[inline]
#[must_use]
pub(crate) fn decode_object_id(v: &[u8]) -> Option<ObjectId> {
    (Unpacker::new(v).map(|p| u64::from(p.u32()) | u64::from(p.u16()) << 32))
        .and_then(ObjectId::new)
}

/// Decodes a control point opcode parameter.
#[inline]
#[must_use]
pub(crate) fn decode_i32(v: &[u8]) -> Option<i32> {
    Unpacker::new(v).map(|p| p.i32())
}

/// Decodes a raw CCC descriptor value.
#[inline]
#[must_use]
pub(crate) fn decode_cccd(v: &[u8]) -> Option<u16> {
    Unpacker::new(v).map(|p| p.u16())
}
