//! Loosely typed metadata values.
//!
//! Electron microscopy files carry metadata in many shapes: DM tag trees, HDF5
//! attributes, JSON blobs, XML. Everything is funneled into [`Value`].
use std::fmt::Display;
use std::str::FromStr;

use indexmap::IndexMap;

/// An ordered string-keyed mapping of [`Value`]s
pub type ValueMap = IndexMap<String, Value>;

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Value>),
    Map(ValueMap),
    #[default]
    Empty,
}

/// The scalar type tag a [`Value`] is described with in a descriptor's
/// configuration block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ValueType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a value for a descriptor's configuration block. Only scalars have a type.
pub fn guess_type(value: &Value) -> Option<ValueType> {
    match value {
        Value::String(_) => Some(ValueType::String),
        Value::Int(_) => Some(ValueType::Integer),
        Value::Float(_) => Some(ValueType::Number),
        Value::Bool(_) => Some(ValueType::Boolean),
        Value::Array(_) | Value::Map(_) | Value::Empty => None,
    }
}

impl Value {
    pub fn is_scalar(&self) -> bool {
        guess_type(self).is_some()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric coercion. Strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Follow a path of map keys into nested maps
    pub fn lookup<'a>(&self, path: impl IntoIterator<Item = &'a str>) -> Option<&Value> {
        let mut current = self;
        for key in path {
            current = current.as_map()?.get(key)?;
        }
        Some(current)
    }

    /// Parse free text into the narrowest scalar it can be, falling back to a string
    pub fn infer(text: &str) -> Value {
        let trimmed = text.trim();
        if let Ok(i) = i64::from_str(trimmed) {
            Value::Int(i)
        } else if let Ok(f) = f64::from_str(trimmed) {
            Value::Float(f)
        } else if trimmed.eq_ignore_ascii_case("true") {
            Value::Bool(true)
        } else if trimmed.eq_ignore_ascii_case("false") {
            Value::Bool(false)
        } else {
            Value::String(trimmed.to_string())
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Empty => Ok(()),
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::Int(value as i64)
                }
            }
        )*
    };
}

value_from_int!(i8, u8, i16, u16, i32, u32, i64);

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Float(value as f64),
        }
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::from(value as u64)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value as f64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

#[cfg(any(feature = "emd", feature = "serde"))]
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Empty,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guess_type() {
        assert_eq!(guess_type(&"nm".into()), Some(ValueType::String));
        assert_eq!(guess_type(&3u16.into()), Some(ValueType::Integer));
        assert_eq!(guess_type(&0.5f64.into()), Some(ValueType::Number));
        assert_eq!(guess_type(&true.into()), Some(ValueType::Boolean));
        assert_eq!(guess_type(&vec![1, 2].into()), None);
        assert_eq!(guess_type(&Value::Empty), None);
        assert_eq!(ValueType::Boolean.to_string(), "boolean");
    }

    #[test]
    fn test_infer_and_coerce() {
        assert_eq!(Value::infer(" 42 "), Value::Int(42));
        assert_eq!(Value::infer("1.5e-3"), Value::Float(1.5e-3));
        assert_eq!(Value::infer("TRUE"), Value::Bool(true));
        assert_eq!(Value::infer("Velox"), Value::String("Velox".into()));
        assert_eq!(Value::from("2.5").as_f64(), Some(2.5));
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float(3.5).as_i64(), None);
        assert_eq!(Value::from(u64::MAX), Value::Float(u64::MAX as f64));
    }

    #[test]
    fn test_lookup() {
        let mut inner = ValueMap::new();
        inner.insert("width".into(), 1.5e-10.into());
        let mut outer = ValueMap::new();
        outer.insert("PixelSize".into(), inner.into());
        let value = Value::Map(outer);
        assert_eq!(
            value.lookup(["PixelSize", "width"]).and_then(Value::as_f64),
            Some(1.5e-10)
        );
        assert!(value.lookup(["PixelSize", "height"]).is_none());
        assert_eq!(value.to_string(), "{PixelSize: {width: 0.00000000015}}");
    }
}
