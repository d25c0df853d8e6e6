//! Signed 15.16 fixed-point values.
//!
//! Every parameter and temperature crossing the host/mesh boundary is a
//! 32-bit two's-complement number with 16 fractional bits, little-endian on
//! the wire.

use serde::{Deserialize, Serialize};

/// A signed 15.16 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Fix16(pub i32);

impl Fix16 {
    pub const FRAC_BITS: u32 = 16;
    pub const ONE: Fix16 = Fix16(1 << Self::FRAC_BITS);
    pub const MAX: Fix16 = Fix16(i32::MAX);
    pub const MIN: Fix16 = Fix16(i32::MIN);

    /// Smallest representable step (2^-16).
    pub const RESOLUTION: f64 = 1.0 / (1u32 << Self::FRAC_BITS) as f64;

    /// Converts with round-to-nearest, saturating at the representable range.
    /// NaN maps to zero.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Fix16(0);
        }
        let scaled = (value * (1u32 << Self::FRAC_BITS) as f64).round();
        if scaled >= i32::MAX as f64 {
            Self::MAX
        } else if scaled <= i32::MIN as f64 {
            Self::MIN
        } else {
            Fix16(scaled as i32)
        }
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 * Self::RESOLUTION
    }

    /// Raw two's-complement bits.
    pub fn to_bits(self) -> u32 {
        self.0 as u32
    }

    pub fn from_bits(bits: u32) -> Self {
        Fix16(bits as i32)
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Fix16(i32::from_le_bytes(bytes))
    }

    /// Fixed-point product, truncating like an arithmetic shift.
    pub fn mul(self, rhs: Fix16) -> Fix16 {
        Fix16(((self.0 as i64 * rhs.0 as i64) >> Self::FRAC_BITS) as i32)
    }
}

impl From<f64> for Fix16 {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<Fix16> for f64 {
    fn from(value: Fix16) -> Self {
        value.to_f64()
    }
}

/// Decodes a packed little-endian vector of fixed-point values.
///
/// Returns `None` unless `bytes` holds a whole number of values.
pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f64>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| Fix16::from_le_bytes([c[0], c[1], c[2], c[3]]).to_f64())
            .collect(),
    )
}

/// Packs values as little-endian fixed-point.
pub fn encode_vector(values: &[f64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| Fix16::from_f64(*v).to_le_bytes())
        .collect()
}
