//! Normalized parameter descriptors.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::types::Value;

/// Direction of a stored-procedure parameter.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    /// Whether the engine writes a value back into this parameter.
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// Tagged parameter value. Adapters branch on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Scalar(Value),
    /// Expanded into `name_1..name_k` at bind time.
    Array(Vec<Value>),
}

/// A named parameter as supplied by the caller.
///
/// The name may carry the engine's placeholder prefix (`:id` or `@id`);
/// it is stripped at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBind {
    pub name: String,
    pub value: ParamValue,
    /// Size hint, applied only when positive.
    pub size: Option<u32>,
    pub direction: Option<Direction>,
}

impl ParamBind {
    /// Scalar parameter. A [`Value::Null`] becomes [`ParamValue::Null`].
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = match value.into() {
            Value::Null => ParamValue::Null,
            v => ParamValue::Scalar(v),
        };
        Self {
            name: name.into(),
            value,
            size: None,
            direction: None,
        }
    }

    /// Array parameter, expanded into one native parameter per element.
    pub fn array<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            name: name.into(),
            value: ParamValue::Array(values.into_iter().map(Into::into).collect()),
            size: None,
            direction: None,
        }
    }

    /// Explicit NULL parameter.
    pub fn null(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ParamValue::Null,
            size: None,
            direction: None,
        }
    }

    /// Output parameter of a stored procedure with a buffer size.
    pub fn output(name: impl Into<String>, size: u32) -> Self {
        Self::null(name)
            .with_direction(Direction::Out)
            .with_size(size)
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Replaces the value, mapping [`Value::Null`] to [`ParamValue::Null`].
    pub fn set_value(&mut self, value: Value) {
        self.value = match value {
            Value::Null => ParamValue::Null,
            v => ParamValue::Scalar(v),
        };
    }

    /// The scalar value, or `Null` for nulls and arrays.
    pub fn scalar(&self) -> &Value {
        match &self.value {
            ParamValue::Scalar(v) => v,
            ParamValue::Null | ParamValue::Array(_) => &Value::Null,
        }
    }
}

/// Outcome of a stored-procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureResult {
    /// Return status reported by the engine (0 when the engine has none).
    pub status: i64,
    /// The bound parameters, with OUT and INOUT values filled in.
    pub parameters: Vec<ParamBind>,
}

impl ProcedureResult {
    /// Value of the named parameter after the call, ignoring ASCII case and
    /// any placeholder prefix.
    pub fn value(&self, name: &str) -> Option<&Value> {
        let wanted = name.trim_start_matches([':', '@']);
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(wanted))
            .map(ParamBind::scalar)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_new_maps_null_value() {
        let p = ParamBind::new("id", None::<i64>);
        assert_eq!(p.value, ParamValue::Null);

        let p = ParamBind::new("id", 7);
        assert_eq!(p.value, ParamValue::Scalar(Value::Int(7)));
    }

    #[test]
    fn test_output_builder() {
        let p = ParamBind::output("total", 64);
        assert_eq!(p.direction, Some(Direction::Out));
        assert_eq!(p.size, Some(64));
        assert_eq!(p.value, ParamValue::Null);
    }

    #[test]
    fn test_direction_from_str() {
        assert_eq!(Direction::from_str("inout").unwrap(), Direction::InOut);
        assert_eq!(Direction::from_str("OUT").unwrap(), Direction::Out);
        assert!(Direction::from_str("sideways").is_err());
        assert!(Direction::InOut.is_output());
        assert!(!Direction::In.is_output());
    }

    #[test]
    fn test_procedure_result_lookup() {
        let result = ProcedureResult {
            status: 0,
            parameters: vec![ParamBind::new("Total", 10)],
        };
        assert_eq!(result.value(":total"), Some(&Value::Int(10)));
        assert_eq!(result.value("missing"), None);
    }
}
