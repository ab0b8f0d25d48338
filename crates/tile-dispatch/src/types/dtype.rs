use crate::error::{DispatchError, Result};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest finite magnitude of FP8 E4M3 (fn variant, no infinities).
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Element data types understood by the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Fp32,
    Fp16,
    Bf16,
    /// FP8 E4M3, stored one byte per element.
    Fp8,
    Int8,
    Int32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn byte_width(self) -> usize {
        match self {
            DataType::Fp32 | DataType::Int32 => 4,
            DataType::Fp16 | DataType::Bf16 => 2,
            DataType::Fp8 | DataType::Int8 => 1,
        }
    }

    /// Canonical short name, also used in kernel symbols.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::Fp32 => "fp32",
            DataType::Fp16 => "fp16",
            DataType::Bf16 => "bf16",
            DataType::Fp8 => "fp8",
            DataType::Int8 => "int8",
            DataType::Int32 => "int32",
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int32)
    }

    /// Stable discriminant usable in `const` contexts.
    pub(crate) const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Decode a little-endian byte buffer of this type into `f32` values.
    pub fn to_f32(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            DataType::Fp32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::Fp16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DataType::Bf16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DataType::Fp8 => bytes.iter().map(|&b| fp8_e4m3_decode(b)).collect(),
            DataType::Int8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
            DataType::Int32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
        }
    }

    /// Decode integer element types without going through `f32`.
    pub fn to_i32(self, bytes: &[u8]) -> Vec<i32> {
        match self {
            DataType::Int8 => bytes.iter().map(|&b| b as i8 as i32).collect(),
            DataType::Int32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => self.to_f32(bytes).into_iter().map(|v| v as i32).collect(),
        }
    }

    /// Encode `f32` values into this type with one rounding step.
    pub fn from_f32(self, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.byte_width());
        match self {
            DataType::Fp32 => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
            DataType::Fp16 => values
                .iter()
                .for_each(|&v| out.extend_from_slice(&f16::from_f32(v).to_le_bytes())),
            DataType::Bf16 => values
                .iter()
                .for_each(|&v| out.extend_from_slice(&bf16::from_f32(v).to_le_bytes())),
            DataType::Fp8 => out.extend(values.iter().map(|&v| fp8_e4m3_encode(v))),
            DataType::Int8 => out.extend(
                values
                    .iter()
                    .map(|&v| v.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8),
            ),
            DataType::Int32 => values
                .iter()
                .for_each(|&v| out.extend_from_slice(&(v.round() as i32).to_le_bytes())),
        }
        out
    }

    /// Encode `i32` values (used for offset and index buffers).
    pub fn from_i32(self, values: &[i32]) -> Vec<u8> {
        match self {
            DataType::Int32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DataType::Int8 => values
                .iter()
                .map(|&v| v.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8)
                .collect(),
            _ => {
                let as_f32: Vec<f32> = values.iter().map(|&v| v as f32).collect();
                self.from_f32(&as_f32)
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(DataType::Fp32),
            "fp16" | "f16" | "float16" => Ok(DataType::Fp16),
            "bf16" | "bfloat16" => Ok(DataType::Bf16),
            "fp8" | "f8" => Ok(DataType::Fp8),
            "int8" | "i8" => Ok(DataType::Int8),
            "int32" | "i32" => Ok(DataType::Int32),
            other => Err(DispatchError::UnsupportedConfiguration(format!(
                "unknown data type '{}'",
                other
            ))),
        }
    }
}

/// Encode an `f32` into FP8 E4M3 (bias 7), saturating at ±448.
///
/// Rounds to nearest, ties to even, like the hardware conversion.
pub fn fp8_e4m3_encode(val: f32) -> u8 {
    if val.is_nan() {
        return 0x7F;
    }
    let sign: u8 = if val.is_sign_negative() { 0x80 } else { 0 };
    let abs = val.abs().min(FP8_E4M3_MAX);
    if abs == 0.0 {
        return sign;
    }

    let exp = ((abs.to_bits() >> 23) & 0xFF) as i32 - 127;
    if exp < -6 {
        // Subnormal range: step is 2^-9.
        let mant = (abs * 512.0).round_ties_even() as u8;
        return if mant >= 8 { sign | 0x08 } else { sign | mant };
    }

    let mut exp = exp;
    let mut mant = ((abs / 2f32.powi(exp) - 1.0) * 8.0).round_ties_even() as i32;
    if mant == 8 {
        exp += 1;
        mant = 0;
    }
    if exp > 8 || (exp == 8 && mant > 6) {
        return sign | 0x7E;
    }
    sign | (((exp + 7) as u8) << 3) | mant as u8
}

/// Decode one FP8 E4M3 byte.
pub fn fp8_e4m3_decode(byte: u8) -> f32 {
    let sign = if byte & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((byte >> 3) & 0x0F) as i32;
    let mant = (byte & 0x07) as f32;
    if exp == 0x0F && byte & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        return sign * mant * 2f32.powi(-9);
    }
    sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("bfloat16".parse::<DataType>().unwrap(), DataType::Bf16);
        assert_eq!("f16".parse::<DataType>().unwrap(), DataType::Fp16);
        assert_eq!("FP8".parse::<DataType>().unwrap(), DataType::Fp8);
        assert!(matches!(
            "fp4".parse::<DataType>(),
            Err(DispatchError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_fp8_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 1.5, 448.0, -448.0, 2.0f32.powi(-9)] {
            assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(v)), v, "value {}", v);
        }
    }

    #[test]
    fn test_fp8_ties_round_to_even() {
        // Halfway between 1.0 and 1.125 goes down, between 1.125 and 1.25 goes up.
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.0625)), 1.0);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.1875)), 1.25);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(-1.0625)), -1.0);
        let step = 2f32.powi(-9);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(0.5 * step)), 0.0);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.5 * step)), 2.0 * step);
    }

    #[test]
    fn test_fp8_saturates() {
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.0e6)), 448.0);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(-500.0)), -448.0);
    }

    #[test]
    fn test_fp8_rounding_error_bounded() {
        // 3 mantissa bits: relative error of a normal value is at most 2^-4.
        for i in 1..200 {
            let v = i as f32 * 0.37;
            let back = fp8_e4m3_decode(fp8_e4m3_encode(v));
            assert!((back - v).abs() / v <= 0.0625 + 1e-6, "{} -> {}", v, back);
        }
    }

    #[test]
    fn test_bf16_codec() {
        let bytes = DataType::Bf16.from_f32(&[1.0, -2.5, 3.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(DataType::Bf16.to_f32(&bytes), vec![1.0, -2.5, 3.0]);
    }

    #[test]
    fn test_int8_clamps() {
        let bytes = DataType::Int8.from_f32(&[300.0, -300.0, 4.4]);
        assert_eq!(DataType::Int8.to_i32(&bytes), vec![127, -128, 4]);
    }
}
