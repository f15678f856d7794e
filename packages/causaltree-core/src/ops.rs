use std::collections::BTreeMap;

use blake3::Hasher;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Payload carried by an atom.
///
/// The weave is generic over the op type; implementations only need to feed a
/// canonical encoding of themselves into the checksum hasher.
pub trait AtomOp: Clone + std::fmt::Debug + PartialEq {
    fn hash_into(&self, hasher: &mut Hasher);
}

/// Scalar stored on a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    fn hash_into(&self, hasher: &mut Hasher) {
        match self {
            Value::Null => {
                hasher.update(&[0]);
            }
            Value::Bool(b) => {
                hasher.update(&[1, *b as u8]);
            }
            Value::Int(n) => {
                hasher.update(&[2]);
                hasher.update(&n.to_be_bytes());
            }
            Value::Text(s) => {
                hasher.update(&[3]);
                hash_bytes(hasher, s.as_bytes());
            }
            Value::Bytes(b) => {
                hasher.update(&[4]);
                hash_bytes(hasher, b);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Application ops understood by the reducer.
///
/// `Unknown` carries kinds introduced by newer builds. They keep their fields so the
/// checksum still verifies, and the reducer ignores them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppOp {
    /// Entity root.
    File { id: String },
    /// Named property of an entity.
    Tag { name: String },
    /// Value written to a tag.
    Value { value: Value },
    /// Text inserted at `index` of the parent's original content.
    Insert { index: u64, text: String },
    /// Without a range: tombstone for the parent. With a range: text removal over the
    /// parent's original content.
    Delete { start: Option<u64>, end: Option<u64> },
    Unknown {
        kind: String,
        fields: BTreeMap<String, Value>,
    },
}

impl AppOp {
    pub fn file(id: impl Into<String>) -> Self {
        AppOp::File { id: id.into() }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        AppOp::Tag { name: name.into() }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        AppOp::Value {
            value: value.into(),
        }
    }

    pub fn insert(index: u64, text: impl Into<String>) -> Self {
        AppOp::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn tombstone() -> Self {
        AppOp::Delete {
            start: None,
            end: None,
        }
    }

    pub fn delete_range(start: u64, end: u64) -> Self {
        AppOp::Delete {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            AppOp::File { .. } => "file",
            AppOp::Tag { .. } => "tag",
            AppOp::Value { .. } => "value",
            AppOp::Insert { .. } => "insert",
            AppOp::Delete { .. } => "delete",
            AppOp::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(
            self,
            AppOp::Delete {
                start: None,
                end: None
            }
        )
    }

    /// Field view used for hashing and serialization. `None` options are omitted.
    pub fn fields(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        match self {
            AppOp::File { id } => {
                out.insert("id".to_string(), Value::Text(id.clone()));
            }
            AppOp::Tag { name } => {
                out.insert("name".to_string(), Value::Text(name.clone()));
            }
            AppOp::Value { value } => {
                out.insert("value".to_string(), value.clone());
            }
            AppOp::Insert { index, text } => {
                out.insert("index".to_string(), Value::Int(*index as i64));
                out.insert("text".to_string(), Value::Text(text.clone()));
            }
            AppOp::Delete { start, end } => {
                if let Some(start) = start {
                    out.insert("start".to_string(), Value::Int(*start as i64));
                }
                if let Some(end) = end {
                    out.insert("end".to_string(), Value::Int(*end as i64));
                }
            }
            AppOp::Unknown { fields, .. } => {
                out.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }

    /// Rebuild an op from its kind and field view. Unrecognized kinds, or known kinds
    /// with fields this build cannot interpret, become `Unknown`.
    pub fn from_fields(kind: &str, fields: BTreeMap<String, Value>) -> Self {
        let text = |name: &str| fields.get(name).and_then(Value::as_text).map(str::to_string);
        let number = |name: &str| fields.get(name).and_then(Value::as_u64);
        let known = match kind {
            "file" => text("id").map(|id| AppOp::File { id }),
            "tag" => text("name").map(|name| AppOp::Tag { name }),
            "value" => Some(AppOp::Value {
                value: fields.get("value").cloned().unwrap_or(Value::Null),
            }),
            "insert" => match (number("index"), text("text")) {
                (Some(index), Some(text)) => Some(AppOp::Insert { index, text }),
                _ => None,
            },
            "delete" => Some(AppOp::Delete {
                start: number("start"),
                end: number("end"),
            }),
            _ => None,
        };
        match known {
            Some(op) if op.fields() == fields => op,
            _ => AppOp::Unknown {
                kind: kind.to_string(),
                fields,
            },
        }
    }
}

impl AtomOp for AppOp {
    fn hash_into(&self, hasher: &mut Hasher) {
        hash_bytes(hasher, self.kind().as_bytes());
        let fields = self.fields();
        hasher.update(&(fields.len() as u32).to_be_bytes());
        for (name, value) in &fields {
            hash_bytes(hasher, name.as_bytes());
            value.hash_into(hasher);
        }
    }
}

fn hash_bytes(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(feature = "serde")]
impl Serialize for AppOp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let fields = self.fields();
        let mut map = serializer.serialize_map(Some(fields.len() + 1))?;
        map.serialize_entry("type", self.kind())?;
        for (name, value) in &fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for AppOp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let kind = match fields.remove("type") {
            Some(Value::Text(kind)) => kind,
            _ => return Err(serde::de::Error::missing_field("type")),
        };
        Ok(AppOp::from_fields(&kind, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_for_known_kinds() {
        let ops = [
            AppOp::file("e1"),
            AppOp::tag("name"),
            AppOp::value("x"),
            AppOp::insert(3, "abc"),
            AppOp::tombstone(),
            AppOp::delete_range(1, 4),
        ];
        for op in ops {
            assert_eq!(AppOp::from_fields(op.kind(), op.fields()), op);
        }
    }

    #[test]
    fn unrecognized_kind_is_preserved() {
        let mut fields = BTreeMap::new();
        fields.insert("device".to_string(), Value::from("abc"));
        let op = AppOp::from_fields("certificate", fields.clone());
        assert_eq!(
            op,
            AppOp::Unknown {
                kind: "certificate".to_string(),
                fields
            }
        );
        assert_eq!(op.kind(), "certificate");
    }

    #[test]
    fn malformed_known_kind_becomes_unknown() {
        let mut fields = BTreeMap::new();
        fields.insert("index".to_string(), Value::from("not a number"));
        fields.insert("text".to_string(), Value::from("x"));
        assert!(matches!(
            AppOp::from_fields("insert", fields),
            AppOp::Unknown { .. }
        ));
    }
}
