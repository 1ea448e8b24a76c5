//! The storage seam: everything above this trait is driver-agnostic.

pub mod memory;

use crate::error::Result;
use crate::schema::{ID_WIRE_NAME, TYPE_TAG};
use crate::value::{Record, Value};

pub use memory::MemoryStorage;

/// A conjunctive record filter, in terms of wire names.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Field equals value, or the field is an array containing the value.
    Eq(String, Value),
    /// Field (or any array element of it) is one of the given values.
    In(String, Vec<Value>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: Value) -> Filter {
        Filter::Eq(field.to_string(), value)
    }

    pub fn is_in(field: &str, values: Vec<Value>) -> Filter {
        Filter::In(field.to_string(), values)
    }

    /// Conjoin two filters, flattening nested conjunctions and dropping
    /// no-op `All` terms.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => {
                let stored = record.get(field).unwrap_or(&Value::Null);
                stored == value
                    || stored
                        .as_array()
                        .is_some_and(|items| items.contains(value))
            }
            Filter::In(field, values) => {
                let stored = record.get(field).unwrap_or(&Value::Null);
                values.contains(stored)
                    || stored
                        .as_array()
                        .is_some_and(|items| items.iter().any(|v| values.contains(v)))
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Which wire names a find returns. The identity and the type tag always
/// survive projection: documents cannot be materialized without them.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Projection {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    pub fn apply(&self, record: &Record) -> Record {
        match self {
            Projection::All => record.clone(),
            Projection::Include(names) => record
                .iter()
                .filter(|(wire, _)| {
                    names.iter().any(|n| n == *wire)
                        || *wire == ID_WIRE_NAME
                        || *wire == TYPE_TAG
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Projection::Exclude(names) => record
                .iter()
                .filter(|(wire, _)| {
                    *wire == ID_WIRE_NAME
                        || *wire == TYPE_TAG
                        || !names.iter().any(|n| n == *wire)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, Order)>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub projection: Projection,
}

/// A single mutation applied by `update_many`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    /// Remove every occurrence of the value from an array field.
    Pull(String, Value),
}

/// The persistence collaborator. One implementation ships in-process
/// (`MemoryStorage`); a driver-backed one plugs in behind the same trait.
pub trait Storage: Send + Sync {
    /// Filtered, ordered, windowed, projected scan of one collection.
    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions)
        -> Result<Vec<Record>>;

    /// Insert records, generating identities where missing. Returns the
    /// identity of each inserted record, in order.
    fn insert_many(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Value>>;

    /// Replace the first matching record wholesale; insert when nothing
    /// matches and `upsert` is set. Returns the number of records written.
    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        record: Record,
        upsert: bool,
    ) -> Result<u64>;

    /// Apply the ops to every matching record. Returns the match count.
    fn update_many(&self, collection: &str, filter: &Filter, ops: &[UpdateOp]) -> Result<u64>;

    /// Returns the number of records removed.
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_eq_matches_scalars_and_array_members() {
        let rec = record(&[
            ("status", Value::String("open".into())),
            (
                "tags",
                Value::Array(vec![Value::String("a".into()), Value::String("b".into())]),
            ),
        ]);
        assert!(Filter::eq("status", Value::String("open".into())).matches(&rec));
        assert!(Filter::eq("tags", Value::String("b".into())).matches(&rec));
        assert!(!Filter::eq("status", Value::String("closed".into())).matches(&rec));
        // A missing field compares as null.
        assert!(Filter::eq("missing", Value::Null).matches(&rec));
    }

    #[test]
    fn test_and_flattens_and_drops_all() {
        let a = Filter::eq("x", Value::Int(1));
        let b = Filter::eq("y", Value::Int(2));
        let c = Filter::eq("z", Value::Int(3));
        assert_eq!(a.clone().and(Filter::All), a);
        let combined = a.clone().and(b.clone()).and(c.clone());
        assert_eq!(combined, Filter::And(vec![a, b, c]));
    }

    #[test]
    fn test_projection_never_drops_identity_or_tag() {
        let rec = record(&[
            (ID_WIRE_NAME, Value::Int(1)),
            (TYPE_TAG, Value::String("Post".into())),
            ("title", Value::String("t".into())),
            ("body", Value::String("b".into())),
        ]);
        let included = Projection::Include(vec!["title".into()]).apply(&rec);
        assert_eq!(
            included.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![TYPE_TAG, ID_WIRE_NAME, "title"]
        );
        let excluded =
            Projection::Exclude(vec!["body".into(), ID_WIRE_NAME.into()]).apply(&rec);
        assert!(excluded.contains_key(ID_WIRE_NAME));
        assert!(!excluded.contains_key("body"));
    }
}
