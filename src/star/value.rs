//! Typed STAR values.
//!
//! Every cell in a looped table or single-row block is a [`Value`]. The
//! semantic type of a column comes from the label registry; unknown labels
//! stay `Str` so that files round-trip losslessly.

/// Semantic type of a STAR column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
    Str,
    /// Boolean stored as `0`/`1` integer, per STAR convention.
    Bool,
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Returns the string content for `Str` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; `Int` widens to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean view of a `Bool`-typed column (`0` = false).
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|i| i != 0)
    }

    /// Parse a raw token according to the declared column type.
    ///
    /// Numeric parse failures are reported to the caller; a declared-numeric
    /// column never silently degrades to a string.
    pub fn parse_typed(token: &str, vtype: ValueType) -> Result<Value, String> {
        match vtype {
            ValueType::Int | ValueType::Bool => token
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("expected integer, got {token:?}")),
            ValueType::Float => token
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("expected float, got {token:?}")),
            ValueType::Str => Ok(Value::Str(token.to_string())),
        }
    }

    /// Render the value as a STAR token (no quoting; the writer handles that).
    pub fn to_token(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            // Six decimals matches what the external engine emits and keeps
            // round-trips value-stable for the magnitudes in these files.
            Value::Float(f) => format!("{f:.6}"),
            Value::Str(s) => s.clone(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_parsing() {
        assert_eq!(
            Value::parse_typed("42", ValueType::Int).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::parse_typed("3.14", ValueType::Float).unwrap(),
            Value::Float(3.14)
        );
        assert_eq!(
            Value::parse_typed("1", ValueType::Bool).unwrap().as_bool(),
            Some(true)
        );
        assert!(Value::parse_typed("abc", ValueType::Float).is_err());
        assert!(Value::parse_typed("1.5", ValueType::Int).is_err());
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Int(7).as_f64(), Some(7.0));
        assert_eq!(Value::Float(2.5).as_i64(), None);
        assert_eq!(Value::Str("x".into()).as_f64(), None);
    }

    #[test]
    fn token_rendering() {
        assert_eq!(Value::Int(-3).to_token(), "-3");
        assert_eq!(Value::Float(1.5).to_token(), "1.500000");
        assert_eq!(Value::Str("a b".into()).to_token(), "a b");
    }
}
