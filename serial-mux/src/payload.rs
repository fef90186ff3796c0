//! Application payload carried over the link.
//!
//! Control messages are four comma-separated decimal values, rendered with
//! one fractional digit, e.g. `12.3,45.6,78.9,0.0`. The transport treats
//! lines as opaque; consumers parse them here and decide what a malformed
//! line means to them.

use std::{fmt, str::FromStr};
use thiserror::Error;

/// Number of values in a setpoint message.
pub const FIELD_COUNT: usize = 4;

/// Payload parse failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("expected {expected} comma-separated values, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("value {index} is not a number: {value:?}")]
    InvalidNumber { index: usize, value: String },
}

/// Four target positions, one per axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Setpoint(pub [f32; FIELD_COUNT]);

impl Setpoint {
    pub fn new(values: [f32; FIELD_COUNT]) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32; FIELD_COUNT] {
        &self.0
    }
}

impl FromStr for Setpoint {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(PayloadError::FieldCount {
                expected: FIELD_COUNT,
                found: fields.len(),
            });
        }

        let mut values = [0.0; FIELD_COUNT];
        for (index, (slot, field)) in values.iter_mut().zip(&fields).enumerate() {
            *slot = field
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| PayloadError::InvalidNumber {
                    index,
                    value: field.to_string(),
                })?;
        }
        Ok(Self(values))
    }
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{:.1}", v)?;
        }
        Ok(())
    }
}
