//! Configuration errors.
//!
//! Absent results (no geocode, no home, too few samples) are `Option`s, not errors.
//! A misconfigured pipeline is the only thing this crate refuses to run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be at most {max}, got {value}")]
    TooLarge { field: &'static str, value: f64, max: f64 },

    #[error("transport window must hold at least 2 samples, got {0}")]
    WindowTooSmall(usize),

    #[error("{field}: lower bound {low} exceeds upper bound {high}")]
    InvertedRange { field: &'static str, low: f64, high: f64 },

    #[cfg(feature = "serde")]
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Check that a threshold is finite and strictly positive.
pub(crate) fn ensure_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

/// Check that a value is finite and not negative.
pub(crate) fn ensure_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { field, value })
    }
}

/// Check that a value does not exceed `max`.
pub(crate) fn ensure_at_most(field: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(ConfigError::TooLarge { field, value, max })
    }
}

pub(crate) fn ensure_ordered(field: &'static str, low: f64, high: f64) -> Result<(), ConfigError> {
    if low <= high {
        Ok(())
    } else {
        Err(ConfigError::InvertedRange { field, low, high })
    }
}
