//! Kubernetes quantity parsing and normalization.
//!
//! Kubernetes uses a few encodings for numeric resource values. CPU is an
//! integer, a float, or a milli-quantity (`250m`). Memory and storage are a
//! milli-quantity or a byte count with a metric postfix (`M`, megabytes) or
//! a binary postfix (`Mi`, mebibytes). The cluster API does not normalize
//! these, so whatever a manifest was written with comes back verbatim; this
//! module identifies the encoding and converts values to a common unit.

use thiserror::Error;

/// The encoding tag of a parsed quantity, which determines the multiplier
/// applied to reach a byte/unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityKind {
    /// A bare number, already in the target unit (CPU cores).
    Plain,
    /// A milli-quantity (`m` suffix), one thousandth of a unit.
    Milli,
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
    K,
    M,
    G,
    T,
    P,
    E,
}

impl QuantityKind {
    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "m" => Self::Milli,
            "Ki" => Self::Ki,
            "Mi" => Self::Mi,
            "Gi" => Self::Gi,
            "Ti" => Self::Ti,
            "Pi" => Self::Pi,
            "Ei" => Self::Ei,
            "K" => Self::K,
            "M" => Self::M,
            "G" => Self::G,
            "T" => Self::T,
            "P" => Self::P,
            "E" => Self::E,
            _ => return None,
        })
    }

    fn multiplier(self) -> f64 {
        match self {
            Self::Plain => 1.0,
            Self::Milli => 1.0 / 1000.0,
            Self::Ki => 1024f64,
            Self::Mi => 1024f64.powi(2),
            Self::Gi => 1024f64.powi(3),
            Self::Ti => 1024f64.powi(4),
            Self::Pi => 1024f64.powi(5),
            Self::Ei => 1024f64.powi(6),
            Self::K => 1000f64,
            Self::M => 1000f64.powi(2),
            Self::G => 1000f64.powi(3),
            Self::T => 1000f64.powi(4),
            Self::P => 1000f64.powi(5),
            Self::E => 1000f64.powi(6),
        }
    }
}

/// A numeric value paired with its encoding tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub kind: QuantityKind,
}

impl Quantity {
    pub fn new(value: f64, kind: QuantityKind) -> Self {
        Self { value, kind }
    }

    /// Normalize to a byte/unit count using the kind's multiplier.
    pub fn to_bytes(&self) -> f64 {
        self.value * self.kind.multiplier()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid quantity value: {0}")]
    InvalidValue(String),
    #[error("unknown quantity suffix: {0}")]
    UnknownSuffix(String),
}

/// Parse a CPU value: `"<n>m"` is a milli-quantity (divide by 1000 for
/// cores), a bare numeric string is a plain core count.
pub fn parse_cpu_quantity(raw: &str) -> Result<Quantity, QuantityError> {
    if let Some(num) = raw.strip_suffix('m') {
        let value = num
            .parse::<f64>()
            .map_err(|_| QuantityError::InvalidValue(raw.to_string()))?;
        return Ok(Quantity::new(value, QuantityKind::Milli));
    }

    raw.parse::<f64>()
        .map(|value| Quantity::new(value, QuantityKind::Plain))
        .map_err(|_| QuantityError::InvalidValue(raw.to_string()))
}

/// Parse a memory/storage value: `<number><suffix>` where the suffix is `m`
/// (milli-quantity), a binary postfix (`Ki`..`Ei`) or a metric postfix
/// (`K`..`E`). Anything else is rejected.
pub fn parse_data_quantity(raw: &str) -> Result<Quantity, QuantityError> {
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (num, suffix) = raw.split_at(split);

    let value = num
        .parse::<f64>()
        .map_err(|_| QuantityError::InvalidValue(raw.to_string()))?;

    let kind = QuantityKind::from_suffix(suffix)
        .ok_or_else(|| QuantityError::UnknownSuffix(suffix.to_string()))?;

    Ok(Quantity::new(value, kind))
}
