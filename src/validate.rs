//! Report data validation
//!
//! Everything written to a device goes through [`IntoReport`] first. Byte
//! buffers pass unchanged; sequences of wider integers are checked element by
//! element so that a value like `256` is rejected instead of being truncated
//! to `0` on its way into the transport.

use hidstream_transport::Report;
use serde_json::Value;

use crate::error::ValidationError;

/// Conversion of caller data into a validated report
pub trait IntoReport {
    fn into_report(self) -> Result<Report, ValidationError>;
}

impl IntoReport for Report {
    fn into_report(self) -> Result<Report, ValidationError> {
        Ok(self)
    }
}

impl IntoReport for &Report {
    fn into_report(self) -> Result<Report, ValidationError> {
        Ok(self.clone())
    }
}

impl IntoReport for &[u8] {
    fn into_report(self) -> Result<Report, ValidationError> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoReport for [u8; N] {
    fn into_report(self) -> Result<Report, ValidationError> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoReport for &[u8; N] {
    fn into_report(self) -> Result<Report, ValidationError> {
        Ok(self.to_vec())
    }
}

/// Check that every element fits in a byte
pub fn validate_values<T>(values: &[T]) -> Result<Report, ValidationError>
where
    T: Copy,
    u8: TryFrom<T>,
    i128: TryFrom<T>,
{
    values
        .iter()
        .enumerate()
        .map(|(index, &v)| {
            u8::try_from(v).map_err(|_| ValidationError::OutOfRange {
                index,
                value: i128::try_from(v).unwrap_or(i128::MAX),
            })
        })
        .collect()
}

macro_rules! impl_into_report_for_ints {
    ($($t:ty),* $(,)?) => {
        $(
            impl IntoReport for &[$t] {
                fn into_report(self) -> Result<Report, ValidationError> {
                    validate_values(self)
                }
            }

            impl IntoReport for Vec<$t> {
                fn into_report(self) -> Result<Report, ValidationError> {
                    validate_values(&self)
                }
            }

            impl IntoReport for &Vec<$t> {
                fn into_report(self) -> Result<Report, ValidationError> {
                    validate_values(self)
                }
            }

            impl<const N: usize> IntoReport for [$t; N] {
                fn into_report(self) -> Result<Report, ValidationError> {
                    validate_values(&self)
                }
            }

            impl<const N: usize> IntoReport for &[$t; N] {
                fn into_report(self) -> Result<Report, ValidationError> {
                    validate_values(self)
                }
            }
        )*
    };
}

impl_into_report_for_ints!(u16, u32, u64, usize, i8, i16, i32, i64);

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Dynamic values: only arrays of integers are byte sequences
impl IntoReport for &Value {
    fn into_report(self) -> Result<Report, ValidationError> {
        let items = self
            .as_array()
            .ok_or_else(|| ValidationError::NotByteSequence(json_kind(self).into()))?;

        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let value = item
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| item.as_u64().map(i128::from))
                    .ok_or_else(|| {
                        ValidationError::NotByteSequence(format!(
                            "an array containing {} at index {index}",
                            json_kind(item)
                        ))
                    })?;
                u8::try_from(value).map_err(|_| ValidationError::OutOfRange { index, value })
            })
            .collect()
    }
}

impl IntoReport for Value {
    fn into_report(self) -> Result<Report, ValidationError> {
        (&self).into_report()
    }
}

/// Parse a textual byte list such as `"0x01, 2 0xff"`
///
/// Tokens are separated by commas and/or whitespace and may be decimal or
/// `0x`-prefixed hex.
pub fn parse_byte_list(text: &str) -> Result<Report, ValidationError> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .enumerate()
        .map(|(index, token)| {
            let parsed = match token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
            {
                Some(hex) => i128::from_str_radix(hex, 16),
                None => token.parse::<i128>(),
            };
            let value = parsed.map_err(|_| ValidationError::InvalidToken(token.to_string()))?;
            u8::try_from(value).map_err(|_| ValidationError::OutOfRange { index, value })
        })
        .collect()
}

/// Check a requested feature report length
pub fn validate_length(length: usize) -> Result<usize, ValidationError> {
    if length == 0 {
        return Err(ValidationError::ZeroLength);
    }
    Ok(length)
}
