//! This is the vector codec and math module
//! Provide the blob layout, the JSON array parser and cosine distance

use crate::error::{CodecError, DistanceError};

/// Width of one encoded element in bytes.
pub const ELEMENT_WIDTH: usize = std::mem::size_of::<f64>();

/// Encode a vector as `8 * len` bytes of little-endian IEEE-754 doubles.
/// No header, no length prefix.
pub fn encode(vector: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * ELEMENT_WIDTH);
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a blob produced by [`encode`].
/// Every bit pattern is preserved, NaN payloads included.
pub fn decode(bytes: &[u8]) -> Result<Vec<f64>, CodecError> {
    if bytes.len() % ELEMENT_WIDTH != 0 {
        return Err(CodecError::InvalidLength(bytes.len()));
    }

    let decoded = bytes
        .chunks_exact(ELEMENT_WIDTH)
        .map(|chunk| {
            let mut raw = [0u8; ELEMENT_WIDTH];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect();

    Ok(decoded)
}

/// Parse a JSON array of numbers, e.g. `"[1.2, -3, 4.5e2]"`.
///
/// Follows the JSON grammar exactly, so it accepts and rejects the same
/// inputs as `serde_json::from_str::<Vec<f64>>` and yields the same values.
/// Numbers that overflow `f64` are rejected.
pub fn parse_json_floats(text: &str) -> Result<Vec<f64>, CodecError> {
    let bytes = text.as_bytes();

    let mut pos = skip_whitespace(bytes, 0);
    if bytes.get(pos) != Some(&b'[') {
        return Err(CodecError::NotAnArray);
    }
    pos += 1;

    let commas = bytes[pos..].iter().filter(|&&b| b == b',').count();
    let mut result = Vec::with_capacity(commas + 1);

    pos = skip_whitespace(bytes, pos);
    if bytes.get(pos) == Some(&b']') {
        pos += 1;
    } else {
        loop {
            let end = scan_number(text, pos)?;
            let value: f64 = text[pos..end]
                .parse()
                .map_err(|_| CodecError::InvalidNumber { offset: pos })?;
            if !value.is_finite() {
                return Err(CodecError::OutOfRange { offset: pos });
            }
            result.push(value);

            pos = skip_whitespace(bytes, end);
            match bytes.get(pos) {
                Some(b',') => pos = skip_whitespace(bytes, pos + 1),
                Some(b']') => {
                    pos += 1;
                    break;
                }
                Some(_) => return Err(invalid_character(text, pos)),
                None => return Err(CodecError::NotAnArray),
            }
        }
    }

    pos = skip_whitespace(bytes, pos);
    if pos != bytes.len() {
        return Err(invalid_character(text, pos));
    }

    Ok(result)
}

/// Negated cosine similarity
/// dist = -(a · b) / (||a|| * ||b||)
/// Smaller is closer. Returns 0.0 when either vector has zero norm.
/// Each side is scaled by a power of two first, so norms of very large or
/// very small vectors stay finite and non-zero.
/// Can only process vectors with same dimensions
pub fn cosine_distance(left: &[f64], right: &[f64]) -> Result<f64, DistanceError> {
    if left.len() != right.len() {
        return Err(DistanceError::LengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }

    let (left_scale, right_scale) = (power_of_two_scale(left), power_of_two_scale(right));
    if left_scale == 0.0 || right_scale == 0.0 {
        return Ok(0.0);
    }

    let (dot, norm_left, norm_right) = left
        .iter()
        .zip(right.iter())
        .map(|(x, y)| (x / left_scale, y / right_scale))
        .fold((0.0_f64, 0.0_f64, 0.0_f64), |(dot, nl, nr), (x, y)| {
            (dot + x * y, nl + x * x, nr + y * y)
        });

    if norm_left == 0.0 || norm_right == 0.0 {
        return Ok(0.0);
    }

    // equal norms keep dist(a, a) at exactly -1.0
    let denominator = if norm_left == norm_right {
        norm_left
    } else {
        norm_left.sqrt() * norm_right.sqrt()
    };
    Ok(-(dot / denominator))
}

/// Largest power of two not above the biggest magnitude in `values`, or 0.0
/// for a zero vector. Dividing by it keeps the squared norms in range.
fn power_of_two_scale(values: &[f64]) -> f64 {
    let max = values.iter().fold(0.0_f64, |max, v| {
        if max.is_nan() || v.is_nan() {
            f64::NAN
        } else {
            max.max(v.abs())
        }
    });
    if max == 0.0 {
        return 0.0;
    }
    // NaN and infinities keep their IEEE result
    if !max.is_finite() {
        return 1.0;
    }
    match max.to_bits() & 0x7FF0_0000_0000_0000 {
        0 => f64::MIN_POSITIVE,
        exponent => f64::from_bits(exponent),
    }
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_whitespace(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn skip_digits(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    pos
}

/// Returns the end offset of the JSON number starting at `start`.
/// -?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?
fn scan_number(text: &str, start: usize) -> Result<usize, CodecError> {
    let bytes = text.as_bytes();
    let malformed = CodecError::InvalidNumber { offset: start };

    let mut pos = start;
    match bytes.get(pos) {
        None => return Err(CodecError::NotAnArray),
        Some(b'-' | b'+' | b'.' | b'0'..=b'9') => {}
        Some(_) => return Err(invalid_character(text, pos)),
    }

    if bytes[pos] == b'-' {
        pos += 1;
    }

    match bytes.get(pos) {
        Some(b'0') => pos += 1,
        Some(b'1'..=b'9') => pos = skip_digits(bytes, pos),
        _ => return Err(malformed),
    }

    if bytes.get(pos) == Some(&b'.') {
        let end = skip_digits(bytes, pos + 1);
        if end == pos + 1 {
            return Err(malformed);
        }
        pos = end;
    }

    if matches!(bytes.get(pos), Some(b'e' | b'E')) {
        pos += 1;
        if matches!(bytes.get(pos), Some(b'+' | b'-')) {
            pos += 1;
        }
        let end = skip_digits(bytes, pos);
        if end == pos {
            return Err(malformed);
        }
        pos = end;
    }

    Ok(pos)
}

fn invalid_character(text: &str, offset: usize) -> CodecError {
    let found = text[offset..].chars().next().unwrap_or('\0');
    CodecError::InvalidCharacter { found, offset }
}
