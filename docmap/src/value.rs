//! The canonical value type shared by documents, wire records and filters.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ulid::Ulid;
use uuid::Uuid;

use crate::document::Document;

/// A single value inside a document, in either its wire form or its canonical
/// in-memory form. `Document` never appears in a wire record; serialization
/// turns embedded documents into `Object` and resolved references into their
/// identity value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Id(Ulid),
    Uuid(Uuid),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Document(Document),
}

/// A raw stored record: wire name -> value.
pub type Record = BTreeMap<String, Value>;

impl Value {
    /// Blankness is a value-class test, not a null test: empty strings,
    /// sequences, mappings and byte buffers are all blank, and so is null.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
            Value::Id(_) => "id",
            Value::Uuid(_) => "uuid",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Document(_) => "document",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Total ordering used by the in-memory backend for sorts. Values of
    /// different types order by a fixed type rank; numbers compare across
    /// `Int`/`Float`.
    pub fn compare(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (Id(a), Id(b)) => a.cmp(b),
            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::DateTime(_) => 5,
            Value::Id(_) => 6,
            Value::Uuid(_) => 7,
            Value::Array(_) => 8,
            Value::Object(_) => 9,
            Value::Document(_) => 10,
        }
    }

    /// Build a `Value` from JSON, for records arriving from a driver that
    /// speaks JSON and for test fixtures. Strings that parse as RFC 3339
    /// datetimes, ULIDs or UUIDs stay strings; typed conversion is the job of
    /// the field descriptors.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render this value as JSON. Datetimes become RFC 3339 strings, ids and
    /// uuids their canonical text forms, bytes a hex string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex_string(b)),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Id(id) => serde_json::Value::String(id.to_string()),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Document(doc) => serde_json::Value::String(format!("<{} document>", doc.schema().name())),
        }
    }
}

impl serde::Serialize for Value {
    /// Serializes as the JSON rendering of `to_json`.
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.to_json(), serializer)
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Parse the common textual datetime forms: RFC 3339 or a bare date.
pub(crate) fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

/// Convert a JSON object into a wire record.
pub fn record_from_json(json: &serde_json::Value) -> Option<Record> {
    match Value::from_json(json) {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// The hashable subset of `Value`, used as a fast map key. Floats, arrays,
/// objects and documents have no stable hash and fall back to a linear scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashableValue {
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Id(Ulid),
    Uuid(Uuid),
}

impl HashableValue {
    pub fn try_from_value(value: &Value) -> Option<HashableValue> {
        match value {
            Value::Bool(b) => Some(HashableValue::Bool(*b)),
            Value::Int(i) => Some(HashableValue::Int(*i)),
            Value::String(s) => Some(HashableValue::String(s.clone())),
            Value::Bytes(b) => Some(HashableValue::Bytes(b.clone())),
            Value::DateTime(dt) => Some(HashableValue::DateTime(*dt)),
            Value::Id(id) => Some(HashableValue::Id(*id)),
            Value::Uuid(u) => Some(HashableValue::Uuid(*u)),
            _ => None,
        }
    }
}

/// A map keyed by `Value` that stays O(1) for hashable keys and degrades to a
/// linear scan bucket for the rest (e.g. composite identities).
#[derive(Debug, Default)]
pub struct ValueMap<T> {
    hashed: std::collections::HashMap<HashableValue, T>,
    nohash: Vec<(Value, T)>,
}

impl<T> ValueMap<T> {
    pub fn new() -> Self {
        ValueMap {
            hashed: std::collections::HashMap::new(),
            nohash: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: Value, value: T) {
        match HashableValue::try_from_value(&key) {
            Some(hashable) => {
                self.hashed.insert(hashable, value);
            }
            None => {
                if let Some(entry) = self.nohash.iter_mut().find(|(k, _)| *k == key) {
                    entry.1 = value;
                } else {
                    self.nohash.push((key, value));
                }
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&T> {
        match HashableValue::try_from_value(key) {
            Some(hashable) => self.hashed.get(&hashable),
            None => self
                .nohash
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.hashed.len() + self.nohash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_values() {
        assert!(Value::Null.is_blank());
        assert!(Value::String(String::new()).is_blank());
        assert!(Value::Bytes(vec![]).is_blank());
        assert!(Value::Array(vec![]).is_blank());
        assert!(Value::Object(BTreeMap::new()).is_blank());

        assert!(!Value::Bool(false).is_blank());
        assert!(!Value::Int(0).is_blank());
        assert!(!Value::String("x".into()).is_blank());
    }

    #[test]
    fn test_compare_numbers_across_kinds() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::Float(3.0).compare(&Value::Int(3)), Ordering::Equal);
    }

    #[test]
    fn test_json_round_trip_for_plain_values() {
        let json = serde_json::json!({
            "title": "Hello",
            "views": 3,
            "rating": 4.5,
            "published": true,
            "tags": ["a", "b"],
        });
        let record = record_from_json(&json).unwrap();
        assert_eq!(record["title"], Value::String("Hello".into()));
        assert_eq!(record["views"], Value::Int(3));
        assert_eq!(record["rating"], Value::Float(4.5));
        assert_eq!(record["published"], Value::Bool(true));
        assert_eq!(
            record["tags"],
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())])
        );

        let back = Value::Object(record).to_json();
        assert_eq!(back, json);
    }

    #[test]
    fn test_parse_datetime_accepts_rfc3339_and_bare_dates() {
        assert!(parse_datetime("2016-05-12T09:00:00Z").is_some());
        assert!(parse_datetime("2016-05-12").is_some());
        assert!(parse_datetime("next tuesday").is_none());
    }

    #[test]
    fn test_value_map_handles_unhashable_keys() {
        let mut map: ValueMap<i32> = ValueMap::new();
        map.insert(Value::String("a".into()), 1);
        // Composite identity: not hashable, goes to the linear bucket.
        let composite = Value::Object(BTreeMap::from([(
            "part".to_string(),
            Value::Int(1),
        )]));
        map.insert(composite.clone(), 2);

        assert_eq!(map.get(&Value::String("a".into())), Some(&1));
        assert_eq!(map.get(&composite), Some(&2));
        assert_eq!(map.len(), 2);
        assert!(!map.contains(&Value::Int(9)));
    }

    #[test]
    fn test_value_map_overwrites_unhashable_key() {
        let mut map: ValueMap<i32> = ValueMap::new();
        let key = Value::Array(vec![Value::Int(1)]);
        map.insert(key.clone(), 1);
        map.insert(key.clone(), 2);
        assert_eq!(map.get(&key), Some(&2));
        assert_eq!(map.len(), 1);
    }
}
