//! In-process storage backend. The default for tests and small tools; the
//! semantics here define what a driver-backed implementation must match.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::trace;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::schema::ID_WIRE_NAME;
use crate::storage::{Filter, FindOptions, Order, Storage, UpdateOp};
use crate::value::{Record, Value};

#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Record>>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Record>>> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn sort_records(records: &mut [Record], sort: &[(String, Order)]) {
    if sort.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for (field, order) in sort {
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            let ord = match order {
                Order::Asc => left.compare(right),
                Order::Desc => right.compare(left),
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

impl Storage for MemoryStorage {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Record>> {
        let collections = self.read();
        let mut matched: Vec<Record> = collections
            .get(collection)
            .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        sort_records(&mut matched, &options.sort);
        let out: Vec<Record> = matched
            .into_iter()
            .skip(options.skip as usize)
            .take(options.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .map(|r| options.projection.apply(&r))
            .collect();
        trace!("find {collection}: {} records", out.len());
        Ok(out)
    }

    fn insert_many(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Value>> {
        let mut collections = self.write();
        let stored = collections.entry(collection.to_string()).or_default();
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            let id = match record.get(ID_WIRE_NAME) {
                Some(id) if !id.is_null() => id.clone(),
                _ => {
                    let id = Value::Id(Ulid::new());
                    record.insert(ID_WIRE_NAME.to_string(), id.clone());
                    id
                }
            };
            if stored
                .iter()
                .any(|existing| existing.get(ID_WIRE_NAME) == Some(&id))
            {
                return Err(Error::Storage(format!(
                    "duplicate identity in '{collection}': {id:?}"
                )));
            }
            stored.push(record);
            ids.push(id);
        }
        trace!("insert {collection}: {} records", ids.len());
        Ok(ids)
    }

    fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        mut record: Record,
        upsert: bool,
    ) -> Result<u64> {
        let mut collections = self.write();
        let stored = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = stored.iter_mut().find(|r| filter.matches(r)) {
            // The identity of a record never changes on replace.
            if let Some(id) = existing.get(ID_WIRE_NAME) {
                record.insert(ID_WIRE_NAME.to_string(), id.clone());
            }
            *existing = record;
            return Ok(1);
        }
        if upsert {
            if !record.contains_key(ID_WIRE_NAME) {
                record.insert(ID_WIRE_NAME.to_string(), Value::Id(Ulid::new()));
            }
            stored.push(record);
            return Ok(1);
        }
        Ok(0)
    }

    fn update_many(&self, collection: &str, filter: &Filter, ops: &[UpdateOp]) -> Result<u64> {
        let mut collections = self.write();
        let Some(stored) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut touched = 0;
        for record in stored.iter_mut().filter(|r| filter.matches(r)) {
            touched += 1;
            for op in ops {
                match op {
                    UpdateOp::Set(field, value) => {
                        record.insert(field.clone(), value.clone());
                    }
                    UpdateOp::Unset(field) => {
                        record.remove(field);
                    }
                    UpdateOp::Pull(field, value) => {
                        if let Some(Value::Array(items)) = record.get_mut(field) {
                            items.retain(|v| v != value);
                        }
                    }
                }
            }
        }
        Ok(touched)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self.write();
        let Some(stored) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|r| !filter.matches(r));
        let removed = (before - stored.len()) as u64;
        trace!("delete {collection}: {removed} records");
        Ok(removed)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collections = self.read();
        Ok(collections
            .get(collection)
            .map(|records| records.iter().filter(|r| filter.matches(r)).count() as u64)
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("collections", &self.collection_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Projection;
    use pretty_assertions::assert_eq;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_generates_missing_identities() {
        let storage = MemoryStorage::new();
        let ids = storage
            .insert_many(
                "things",
                vec![
                    record(&[("n", Value::Int(1))]),
                    record(&[(ID_WIRE_NAME, Value::Int(7)), ("n", Value::Int(2))]),
                ],
            )
            .unwrap();
        assert!(matches!(ids[0], Value::Id(_)));
        assert_eq!(ids[1], Value::Int(7));
        assert_eq!(storage.count("things", &Filter::All).unwrap(), 2);
    }

    #[test]
    fn test_insert_rejects_duplicate_identity() {
        let storage = MemoryStorage::new();
        storage
            .insert_many("things", vec![record(&[(ID_WIRE_NAME, Value::Int(1))])])
            .unwrap();
        let dup = storage.insert_many("things", vec![record(&[(ID_WIRE_NAME, Value::Int(1))])]);
        assert!(matches!(dup, Err(Error::Storage(_))));
    }

    #[test]
    fn test_find_sorts_windows_and_projects() {
        let storage = MemoryStorage::new();
        for n in [3i64, 1, 2, 5, 4] {
            storage
                .insert_many(
                    "nums",
                    vec![record(&[("n", Value::Int(n)), ("aux", Value::Bool(true))])],
                )
                .unwrap();
        }
        let options = FindOptions {
            sort: vec![("n".to_string(), Order::Desc)],
            skip: 1,
            limit: Some(2),
            projection: Projection::Include(vec!["n".into()]),
        };
        let found = storage.find("nums", &Filter::All, &options).unwrap();
        let ns: Vec<&Value> = found.iter().map(|r| &r["n"]).collect();
        assert_eq!(ns, vec![&Value::Int(4), &Value::Int(3)]);
        assert!(found.iter().all(|r| !r.contains_key("aux")));
        assert!(found.iter().all(|r| r.contains_key(ID_WIRE_NAME)));
    }

    #[test]
    fn test_replace_one_keeps_identity_and_upserts() {
        let storage = MemoryStorage::new();
        storage
            .insert_many(
                "posts",
                vec![record(&[(ID_WIRE_NAME, Value::Int(1)), ("v", Value::Int(1))])],
            )
            .unwrap();
        let written = storage
            .replace_one(
                "posts",
                &Filter::eq(ID_WIRE_NAME, Value::Int(1)),
                record(&[("v", Value::Int(2))]),
                false,
            )
            .unwrap();
        assert_eq!(written, 1);
        let found = storage
            .find(
                "posts",
                &Filter::eq(ID_WIRE_NAME, Value::Int(1)),
                &FindOptions::default(),
            )
            .unwrap();
        assert_eq!(found[0]["v"], Value::Int(2));

        let missed = storage
            .replace_one(
                "posts",
                &Filter::eq(ID_WIRE_NAME, Value::Int(99)),
                record(&[("v", Value::Int(9))]),
                false,
            )
            .unwrap();
        assert_eq!(missed, 0);
        let upserted = storage
            .replace_one(
                "posts",
                &Filter::eq(ID_WIRE_NAME, Value::Int(99)),
                record(&[(ID_WIRE_NAME, Value::Int(99))]),
                true,
            )
            .unwrap();
        assert_eq!(upserted, 1);
        assert_eq!(storage.count("posts", &Filter::All).unwrap(), 2);
    }

    #[test]
    fn test_update_many_set_unset_pull() {
        let storage = MemoryStorage::new();
        storage
            .insert_many(
                "docs",
                vec![record(&[
                    ("status", Value::String("old".into())),
                    ("gone", Value::Int(1)),
                    (
                        "refs",
                        Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(1)]),
                    ),
                ])],
            )
            .unwrap();
        let touched = storage
            .update_many(
                "docs",
                &Filter::All,
                &[
                    UpdateOp::Set("status".into(), Value::String("new".into())),
                    UpdateOp::Unset("gone".into()),
                    UpdateOp::Pull("refs".into(), Value::Int(1)),
                ],
            )
            .unwrap();
        assert_eq!(touched, 1);
        let found = storage.find("docs", &Filter::All, &FindOptions::default()).unwrap();
        assert_eq!(found[0]["status"], Value::String("new".into()));
        assert!(!found[0].contains_key("gone"));
        assert_eq!(found[0]["refs"], Value::Array(vec![Value::Int(2)]));
    }

    #[test]
    fn test_delete_many_returns_removed_count() {
        let storage = MemoryStorage::new();
        for n in 0..4 {
            storage
                .insert_many("docs", vec![record(&[("n", Value::Int(n))])])
                .unwrap();
        }
        let removed = storage
            .delete_many("docs", &Filter::is_in("n", vec![Value::Int(1), Value::Int(2)]))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.count("docs", &Filter::All).unwrap(), 2);
    }
}
