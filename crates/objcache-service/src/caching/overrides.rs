use std::fmt;

/// A value assigned to a named property of a freshly created item.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl OverrideValue {
    /// Interprets the value as a non-negative integer.
    ///
    /// Floats are accepted when they have no fractional part.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::Int(value) => u32::try_from(value).ok(),
            Self::Float(value) if value.fract() == 0.0 && value >= 0.0 => {
                u32::try_from(value as i64).ok()
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for OverrideValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for OverrideValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for OverrideValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for OverrideValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for OverrideValue {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for OverrideValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Named property values applied, in order, to every item created by a loader.
pub type PropertyOverrides = Vec<(String, OverrideValue)>;
