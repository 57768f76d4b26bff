//! Dynamically-typed state values.

/// The value carried by a state interval.
///
/// Six storage classes: null, 32-bit integer, 64-bit integer, 64-bit float,
/// UTF-8 text, and an opaque binary blob. `Null` means "no value" and is a
/// legitimate state (an attribute that is absent), not an error.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StateValue {
    /// No value.
    Null,
    /// A 32-bit signed integer.
    Int(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A UTF-8 text string.
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

/// The storage class of a non-null value, used to enforce per-attribute type
/// discipline during construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Text,
    Blob,
}

impl ValueKind {
    /// Stable name, used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Text => "text",
            Self::Blob => "blob",
        }
    }
}

impl StateValue {
    /// The storage class of this value, or `None` for `Null`.
    #[must_use]
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::Int(_) => Some(ValueKind::Int),
            Self::Long(_) => Some(ValueKind::Long),
            Self::Float(_) => Some(ValueKind::Float),
            Self::Text(_) => Some(ValueKind::Text),
            Self::Blob(_) => Some(ValueKind::Blob),
        }
    }

    /// Returns true if this is the null value.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to extract a 32-bit integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to extract a 64-bit integer.
    #[must_use]
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Try to extract a float.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to extract a text reference.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to extract a blob reference.
    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Size of this value's on-disk payload (tag byte excluded).
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Int(_) => 4,
            Self::Long(_) | Self::Float(_) => 8,
            Self::Text(s) => 4 + s.len(),
            Self::Blob(b) => 4 + b.len(),
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "blob[{}]", b.len()),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StateValue::Null.kind(), None);
        assert_eq!(StateValue::Int(1).kind(), Some(ValueKind::Int));
        assert_eq!(StateValue::Long(1).kind(), Some(ValueKind::Long));
        assert_eq!(StateValue::Float(1.0).kind(), Some(ValueKind::Float));
        assert_eq!(StateValue::from("x").kind(), Some(ValueKind::Text));
        assert_eq!(StateValue::Blob(vec![1]).kind(), Some(ValueKind::Blob));
    }

    #[test]
    fn accessors() {
        assert_eq!(StateValue::Int(7).as_int(), Some(7));
        assert_eq!(StateValue::Int(7).as_long(), None);
        assert_eq!(StateValue::from("hi").as_text(), Some("hi"));
        assert!(StateValue::Null.is_null());
    }

    #[test]
    fn payload_sizes() {
        assert_eq!(StateValue::Null.payload_size(), 0);
        assert_eq!(StateValue::Int(0).payload_size(), 4);
        assert_eq!(StateValue::Long(0).payload_size(), 8);
        assert_eq!(StateValue::Float(0.0).payload_size(), 8);
        assert_eq!(StateValue::from("abc").payload_size(), 7);
        assert_eq!(StateValue::Blob(vec![0; 10]).payload_size(), 14);
    }

    #[test]
    fn equality_drives_coalescing() {
        // The transient state relies on PartialEq to skip same-value updates.
        assert_eq!(StateValue::Int(3), StateValue::Int(3));
        assert_ne!(StateValue::Int(3), StateValue::Long(3));
        assert_eq!(StateValue::Null, StateValue::Null);
    }
}
