//! Decoding of raw sensor payloads into kilograms.
//!
//! The scale publishes plain text grams, e.g. `1234` or `1234,5` when the
//! firmware uses a European locale.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is empty")]
    Empty,
    #[error("payload '{0}' is not a number")]
    NotANumber(String),
    #[error("payload '{0}' is not a finite weight")]
    NotFinite(String),
}

/// Decodes a gram reading and returns kilograms at 0.1 kg resolution.
pub fn decode_weight_payload(payload: &[u8]) -> Result<f64, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(PayloadError::Empty);
    }

    let normalized = text.replace(',', ".");
    let grams: f64 = normalized
        .parse()
        .map_err(|_| PayloadError::NotANumber(text.to_string()))?;
    if !grams.is_finite() {
        return Err(PayloadError::NotFinite(text.to_string()));
    }

    Ok(round_to_tenth(grams / 1000.0))
}

/// Rounds the exact binary value to one decimal; exact ties go to even.
///
/// `(kg * 10.0).round()` would round the already inexact product, so
/// 1.15 (stored as 1.1499...) would come out as 1.2.
pub fn round_to_tenth(kg: f64) -> f64 {
    let rounded = format!("{:.1}", kg).parse::<f64>().unwrap_or(kg);
    // -0.0 reads badly in the UI
    if rounded == 0.0 { 0.0 } else { rounded }
}
