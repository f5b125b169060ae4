use std::fmt;

/// Validation failures raised eagerly, before any randomness is drawn or
/// any gradient node is recorded.
///
/// They travel inside `candle_core::Error` (see the `From` impl) so the
/// library keeps candle's `Result` everywhere.
#[derive(Debug, Clone, PartialEq)]
pub enum RelaxError {
    /// parameter shapes/sizes are inconsistent, or `D == 1`
    ShapeMismatch(String),
    /// non-positive scale or temperature, unsupported dtype
    InvalidParameter(String),
}

impl fmt::Display for RelaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelaxError::ShapeMismatch(msg) => write!(f, "shape mismatch: {}", msg),
            RelaxError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
        }
    }
}

impl std::error::Error for RelaxError {}

impl From<RelaxError> for candle_core::Error {
    fn from(err: RelaxError) -> Self {
        candle_core::Error::wrap(err)
    }
}

/// Positive, finite temperature or an `InvalidParameter` error
pub fn check_temperature(temperature: f64) -> candle_core::Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(RelaxError::InvalidParameter(format!(
            "temperature must be positive, got {}",
            temperature
        ))
        .into())
    }
}
