use std::collections::HashMap;

use thiserror::Error;

/// Errors produced when a number format configuration is applied.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The format kind string is not one of the supported kinds.
    #[error("unknown number format {0:?} (expected \"fixed\" or \"precision\")")]
    UnknownKind(String),

    /// A fixed format was configured with a negative decimal count.
    #[error("fixed format length must be >= 0, got {0}")]
    NegativeFixedLength(i64),

    /// A precision format was configured with zero or negative digits.
    #[error("precision format length must be > 0, got {0}")]
    NonPositivePrecision(i64),
}

/// Validated per-data-point rendering rule.
///
/// Construction goes through [`NumberFormat::parse`], so an invalid
/// length can never reach the conversion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    /// Round to a fixed number of decimal places.
    Fixed(u32),
    /// Round to a number of significant digits.
    Precision(u32),
}

impl NumberFormat {
    /// Validates a raw `(kind, length)` pair from configuration.
    pub fn parse(kind: &str, length: i64) -> Result<Self, FormatError> {
        match kind {
            "fixed" => {
                if length < 0 {
                    return Err(FormatError::NegativeFixedLength(length));
                }
                Ok(Self::Fixed(length as u32))
            }
            "precision" => {
                if length <= 0 {
                    return Err(FormatError::NonPositivePrecision(length));
                }
                Ok(Self::Precision(length as u32))
            }
            other => Err(FormatError::UnknownKind(other.to_string())),
        }
    }
}

/// A sampled value on its way to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    Bool(bool),
    Number(f64),
}

impl From<bool> for SampleValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

/// Deterministic numeric-to-string rendering per data point.
///
/// Data points without a registered format render through plain `f64`
/// Display. Rounded output is re-parsed so insignificant trailing zeros
/// never reach the wire (`"1234.40"` becomes `"1234.4"`).
#[derive(Debug, Default)]
pub struct NumberFormatter {
    formats: HashMap<String, NumberFormat>,
}

impl NumberFormatter {
    /// Creates a formatter with no registered formats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the format for a data point.
    pub fn set_format(&mut self, id: impl Into<String>, format: NumberFormat) {
        self.formats.insert(id.into(), format);
    }

    /// Removes the format for a data point, returning the previous rule.
    pub fn remove_format(&mut self, id: &str) -> Option<NumberFormat> {
        self.formats.remove(id)
    }

    /// Returns the registered format for a data point.
    pub fn format(&self, id: &str) -> Option<NumberFormat> {
        self.formats.get(id).copied()
    }

    /// Renders a sampled value for the given data point.
    ///
    /// Booleans fold to 1/0 before any formatting. Non-finite values
    /// bypass rounding and render via their Display form.
    pub fn convert(&self, id: &str, value: impl Into<SampleValue>) -> String {
        let v = match value.into() {
            SampleValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            SampleValue::Number(n) => n,
        };

        if !v.is_finite() {
            return v.to_string();
        }

        match self.formats.get(id) {
            None => v.to_string(),
            Some(NumberFormat::Fixed(decimals)) => {
                strip_insignificant_zeros(format!("{v:.prec$}", prec = *decimals as usize))
            }
            Some(NumberFormat::Precision(digits)) => {
                if v == 0.0 {
                    return "0".to_string();
                }
                strip_insignificant_zeros(format!(
                    "{v:.prec$e}",
                    prec = digits.saturating_sub(1) as usize
                ))
            }
        }
    }
}

/// Round-trips a rendered number through `f64` so `"1234.40"` and
/// `"1.2e3"` both come back in canonical Display form.
fn strip_insignificant_zeros(rendered: String) -> String {
    match rendered.parse::<f64>() {
        Ok(v) => v.to_string(),
        Err(_) => rendered,
    }
}
