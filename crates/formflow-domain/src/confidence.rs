//! Confidence score module

use serde::{Deserialize, Serialize};

/// Confidence score for a single extracted field
///
/// Always within [0.0, 1.0]. Analyzers occasionally report values slightly
/// outside that range (or NaN for fields they could not score), so scores are
/// clamped on construction instead of rejected.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    /// Create a confidence score, clamping into [0, 1]
    ///
    /// NaN maps to 0.0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// Get the raw score
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Check whether the score meets a threshold
    pub fn at_least(&self, threshold: f64) -> bool {
        self.0 >= threshold
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> Self {
        c.0
    }
}
