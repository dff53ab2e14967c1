//! Safe numeric casting utilities for raster block processing.
//!
//! This module documents and centralizes our assumptions about numeric
//! ranges in the mosaic pipeline.
//!
//! # Design Decisions
//!
//! ## Pixel Values (integer → `f32`)
//! Blocks of every source datatype are decoded to `f32` for composition.
//! Precision loss for integer values above 2^24 is intentional and accepted;
//! this matches common raster processing practice.
//!
//! ## Pixel Values (`f32` → integer)
//! On encode, values are rounded and saturated to the output type's range.
//! Composition only ever moves source values or the nodata sentinel into the
//! output, so saturation is a no-op for well-formed inputs.
//!
//! ## Pixel Coordinates (`f64` → `i64`)
//! World-to-pixel mappings produce floats that are rounded to the nearest
//! pixel edge. Grid-aligned inputs make these exact up to float noise, which
//! rounding absorbs.

/// Round a fractional pixel coordinate to the nearest integer edge.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn round_pixel(v: f64) -> i64 {
    v.round() as i64
}

/// Convert a `usize` dimension to `u32`, failing on overflow.
///
/// # Errors
/// Returns an error string if the value exceeds `u32::MAX`.
#[inline]
pub fn usize_to_u32(value: usize) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("Value {value} exceeds u32 maximum"))
}

/// Encode composed `f32` pixels as `u8` with round-and-saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn f32s_to_u8(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .map(|&v| v.round().clamp(0.0, f32::from(u8::MAX)) as u8)
        .collect()
}

/// Encode composed `f32` pixels as `u16` with round-and-saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn f32s_to_u16(values: &[f32]) -> Vec<u16> {
    values
        .iter()
        .map(|&v| v.round().clamp(0.0, f32::from(u16::MAX)) as u16)
        .collect()
}

/// Encode composed `f32` pixels as `i16` with round-and-saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32s_to_i16(values: &[f32]) -> Vec<i16> {
    values
        .iter()
        .map(|&v| v.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16)
        .collect()
}

/// Encode composed `f32` pixels as `u32` with round-and-saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn f32s_to_u32(values: &[f32]) -> Vec<u32> {
    values
        .iter()
        .map(|&v| v.round().clamp(0.0, u32::MAX as f32) as u32)
        .collect()
}

/// Encode composed `f32` pixels as `i32` with round-and-saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn f32s_to_i32(values: &[f32]) -> Vec<i32> {
    values
        .iter()
        .map(|&v| v.round().clamp(i32::MIN as f32, i32::MAX as f32) as i32)
        .collect()
}

/// Widen composed `f32` pixels to `f64`.
#[must_use]
pub fn f32s_to_f64(values: &[f32]) -> Vec<f64> {
    values.iter().map(|&v| f64::from(v)).collect()
}
