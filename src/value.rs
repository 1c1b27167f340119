use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Sentinel emitted when a nested structure exceeds the recursion bound.
pub(crate) const MAX_DEPTH_SENTINEL: &str = "[max depth reached]";

/// Recursion bound applied by the JSON formatter and the redactor.
pub(crate) const MAX_FIELD_DEPTH: usize = 5;

/// A structured field value.
///
/// Fields arrive from producers as a mapping from string keys to these tagged
/// variants; formatters must handle each arm exhaustively. Shapes outside
/// this set are rejected at the API boundary by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Map(FieldMap),
}

/// An ordered string-keyed field map.
pub type FieldMap = BTreeMap<String, FieldValue>;

impl FieldValue {
    /// Stable scalar rendering used by the text formatter for `k=v` pairs.
    ///
    /// Nested lists and maps are JSON-encoded inline.
    #[must_use]
    pub fn render_scalar(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::I64(i) => i.to_string(),
            Self::U64(u) => u.to_string(),
            Self::F64(f) => {
                let mut s = String::new();
                // keep integral floats distinguishable from integers
                if f.fract() == 0.0 && f.is_finite() {
                    write!(s, "{:.1}", f).ok();
                } else {
                    write!(s, "{}", f).ok();
                }
                s
            }
            Self::Str(s) => s.clone(),
            Self::Bytes(b) => hex_string(b),
            Self::List(_) | Self::Map(_) => {
                serde_json::to_string(&BoundedJson { value: self, depth: 0 })
                    .unwrap_or_else(|_| "[circular reference]".to_string())
            }
        }
    }

}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("0x");
    for b in bytes {
        write!(s, "{:02x}", b).ok();
    }
    s
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::I64(i64::from(v))
    }
}
impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}
impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::U64(u64::from(v))
    }
}
impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}
impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}
impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}
impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Serializes a `FieldValue` with the recursion bound applied.
///
/// At the bound, nested lists and maps are replaced by the sentinel string,
/// so the serializer terminates on any input.
pub(crate) struct BoundedJson<'a> {
    pub value: &'a FieldValue,
    pub depth: usize,
}

impl<'a> Serialize for BoundedJson<'a> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::I64(i) => serializer.serialize_i64(*i),
            FieldValue::U64(u) => serializer.serialize_u64(*u),
            FieldValue::F64(f) => serializer.serialize_f64(*f),
            FieldValue::Str(s) => serializer.serialize_str(s),
            FieldValue::Bytes(b) => serializer.serialize_str(&hex_string(b)),
            FieldValue::List(items) => {
                if self.depth >= MAX_FIELD_DEPTH {
                    return serializer.serialize_str(MAX_DEPTH_SENTINEL);
                }
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&BoundedJson {
                        value: item,
                        depth: self.depth + 1,
                    })?;
                }
                seq.end()
            }
            FieldValue::Map(map) => {
                if self.depth >= MAX_FIELD_DEPTH {
                    return serializer.serialize_str(MAX_DEPTH_SENTINEL);
                }
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(
                        k,
                        &BoundedJson {
                            value: v,
                            depth: self.depth + 1,
                        },
                    )?;
                }
                m.end()
            }
        }
    }
}

/// Serializes a whole field map with the recursion bound applied.
pub(crate) struct BoundedJsonMap<'a>(pub &'a FieldMap);

impl<'a> Serialize for BoundedJsonMap<'a> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut m = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            m.serialize_entry(k, &BoundedJson { value: v, depth: 1 })?;
        }
        m.end()
    }
}

/// Builds a [`FieldMap`] from `key => value` pairs.
///
/// ```ignore
/// let fields = fields! { "user" => "alice", "attempt" => 3 };
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::FieldMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::FieldMap::new();
        $( map.insert(::std::string::String::from($key), $crate::FieldValue::from($value)); )+
        map
    }};
}
