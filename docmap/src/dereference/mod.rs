//! Batched reference resolution: scan documents for unresolved references,
//! fetch each target collection once, attach the results in place.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::db::Database;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::fields::{Field, FieldKind};
use crate::schema::{Schema, ID_WIRE_NAME};
use crate::storage::{Filter, FindOptions};
use crate::value::{Record, Value, ValueMap};

/// Resolve reference fields of one document in place. `paths` selects which
/// references to follow as dotted attribute paths ("author",
/// "comments.author"); `None` follows every reference field one level deep.
pub fn dereference(db: &Database, doc: &mut Document, paths: Option<&[String]>) -> Result<()> {
    dereference_documents(db, std::slice::from_mut(doc), paths)
}

/// Resolve references across a batch of documents. Storage is consulted
/// exactly once per distinct target collection, however many references
/// point into it.
pub fn dereference_documents(
    db: &Database,
    docs: &mut [Document],
    paths: Option<&[String]>,
) -> Result<()> {
    let parsed: Option<Vec<Vec<String>>> = paths.map(|ps| {
        ps.iter()
            .map(|p| p.split('.').map(str::to_string).collect())
            .collect()
    });
    let branches: Branches<'_> = parsed
        .as_ref()
        .map(|bs| bs.iter().map(Vec::as_slice).collect());
    run(db, docs, &branches)
}

/// The active path selection at one nesting level. `None` means "every
/// reference here"; each slice is the remainder of one requested path.
type Branches<'a> = Option<Vec<&'a [String]>>;

/// The selection one level down through attribute `attr`: `None` if the
/// attribute is not on any requested path, otherwise the tail branches.
fn descend<'a>(branches: &Branches<'a>, attr: &str) -> Option<Branches<'a>> {
    match branches {
        None => Some(None),
        Some(active) => {
            let tails: Vec<&'a [String]> = active
                .iter()
                .filter(|path| path.first().map(String::as_str) == Some(attr))
                .map(|path| &path[1..])
                .collect();
            if tails.is_empty() {
                None
            } else {
                Some(Some(tails))
            }
        }
    }
}

struct Pending {
    schema: Arc<Schema>,
    seen: ValueMap<()>,
    ids: Vec<Value>,
}

impl Pending {
    fn add(&mut self, id: Value) {
        if !self.seen.contains(&id) {
            self.seen.insert(id.clone(), ());
            self.ids.push(id);
        }
    }
}

fn run<'a>(db: &Database, docs: &mut [Document], branches: &Branches<'a>) -> Result<()> {
    // Phase 1: collect unresolved reference identities per collection.
    let mut pending: HashMap<String, Pending> = HashMap::new();
    for doc in docs.iter() {
        scan_document(db, doc, branches, &mut pending)?;
    }
    if pending.is_empty() {
        return Ok(());
    }

    // Phase 2: one fetch per distinct collection.
    let mut resolved: HashMap<String, (Arc<Schema>, ValueMap<Record>)> = HashMap::new();
    for (collection, pending) in pending {
        debug!(
            "dereference: fetching {} record(s) from '{collection}'",
            pending.ids.len()
        );
        let records = db.storage().find(
            &collection,
            &Filter::is_in(ID_WIRE_NAME, pending.ids),
            &FindOptions::default(),
        )?;
        let mut by_id = ValueMap::new();
        for record in records {
            if let Some(id) = record.get(ID_WIRE_NAME).cloned() {
                by_id.insert(id, record);
            }
        }
        resolved.insert(collection, (pending.schema, by_id));
    }

    // Phase 3: attach fetched documents, then follow deeper path tails in
    // one batched pass per attribute.
    let mut follow_ups: FollowUps<'a> = FollowUps::new();
    for (index, doc) in docs.iter_mut().enumerate() {
        attach_document(db, doc, branches, &resolved, index, &mut follow_ups)?;
    }
    apply_follow_ups(db, docs, follow_ups)
}

fn scan_document(
    db: &Database,
    doc: &Document,
    branches: &Branches<'_>,
    pending: &mut HashMap<String, Pending>,
) -> Result<()> {
    for field in doc.schema().fields().to_vec() {
        let Some(sub) = descend(branches, field.name()) else {
            continue;
        };
        if !doc.is_set(field.name()) {
            continue;
        }
        let value = doc.value(field.name())?;
        scan_value(db, &value, &field, &sub, pending)?;
    }
    Ok(())
}

fn scan_value(
    db: &Database,
    value: &Value,
    field: &Field,
    branches: &Branches<'_>,
    pending: &mut HashMap<String, Pending>,
) -> Result<()> {
    match field.kind() {
        FieldKind::Reference(target, _) => {
            if matches!(value, Value::Document(_) | Value::Null) {
                return Ok(());
            }
            let schema = target.resolve(db.registry())?;
            let pk = schema.identity_field().ok_or_else(|| {
                Error::Definition(format!("'{}' has no identity field", schema.name()))
            })?;
            let wire_id = pk
                .to_wire(value, db.registry())
                .map_err(|msg| Error::validation_message(field.name(), msg))?;
            pending
                .entry(schema.collection().to_string())
                .or_insert_with(|| Pending {
                    schema,
                    seen: ValueMap::new(),
                    ids: Vec::new(),
                })
                .add(wire_id);
        }
        FieldKind::Embedded(_) => {
            if let Value::Document(inner) = value {
                scan_document(db, inner, branches, pending)?;
            }
        }
        FieldKind::EmbeddedList(_) => {
            if let Value::Array(items) = value {
                for item in items {
                    if let Value::Document(inner) = item {
                        scan_document(db, inner, branches, pending)?;
                    }
                }
            }
        }
        FieldKind::List(Some(item_field)) => {
            if let Value::Array(items) = value {
                for item in items {
                    scan_value(db, item, item_field, branches, pending)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

type FollowUps<'a> = HashMap<String, (Vec<&'a [String]>, Vec<(usize, Document)>)>;

fn attach_document<'a>(
    db: &Database,
    doc: &mut Document,
    branches: &Branches<'a>,
    resolved: &HashMap<String, (Arc<Schema>, ValueMap<Record>)>,
    doc_index: usize,
    follow_ups: &mut FollowUps<'a>,
) -> Result<()> {
    for field in doc.schema().fields().to_vec() {
        let Some(sub) = descend(branches, field.name()) else {
            continue;
        };
        if !doc.is_set(field.name()) {
            continue;
        }
        let value = doc.value(field.name())?;
        let attached = attach_value(db, &value, &field, &sub, resolved)?;
        if let Some(new_value) = attached {
            // A deeper tail through a reference is resolved in a follow-up
            // batch once every document at this level has been attached.
            if let (Value::Document(inner), FieldKind::Reference(..), Some(tails)) =
                (&new_value, field.kind(), &sub)
            {
                if !tails.is_empty() && tails.iter().any(|t| !t.is_empty()) {
                    let entry = follow_ups
                        .entry(field.name().to_string())
                        .or_insert_with(|| {
                            (
                                tails.iter().filter(|t| !t.is_empty()).copied().collect(),
                                Vec::new(),
                            )
                        });
                    entry.1.push((doc_index, inner.clone()));
                }
            }
            doc.set(field.name(), new_value)?;
        }
    }
    Ok(())
}

/// Attach into one value. Returns the replacement value, or `None` when
/// nothing changed.
fn attach_value(
    db: &Database,
    value: &Value,
    field: &Field,
    branches: &Branches<'_>,
    resolved: &HashMap<String, (Arc<Schema>, ValueMap<Record>)>,
) -> Result<Option<Value>> {
    match field.kind() {
        FieldKind::Reference(target, _) => {
            if matches!(value, Value::Document(_) | Value::Null) {
                return Ok(None);
            }
            let schema = target.resolve(db.registry())?;
            let Some((fetched_schema, by_id)) = resolved.get(schema.collection()) else {
                return Ok(None);
            };
            let pk = schema.identity_field().ok_or_else(|| {
                Error::Definition(format!("'{}' has no identity field", schema.name()))
            })?;
            let wire_id = pk
                .to_wire(value, db.registry())
                .map_err(|msg| Error::validation_message(field.name(), msg))?;
            match by_id.get(&wire_id) {
                Some(record) => {
                    let inner = Document::from_record(
                        fetched_schema.clone(),
                        db.registry().clone(),
                        record.clone(),
                    )?;
                    Ok(Some(Value::Document(inner)))
                }
                // Dangling reference: the target was deleted out from under
                // us. Resolve to null rather than erroring.
                None => Ok(Some(Value::Null)),
            }
        }
        FieldKind::Embedded(_) => {
            if let Value::Document(inner) = value {
                let mut inner = inner.clone();
                let mut noop = FollowUps::new();
                attach_document(db, &mut inner, branches, resolved, 0, &mut noop)?;
                apply_follow_ups(db, std::slice::from_mut(&mut inner), noop)?;
                return Ok(Some(Value::Document(inner)));
            }
            Ok(None)
        }
        FieldKind::EmbeddedList(_) => {
            if let Value::Array(items) = value {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Value::Document(inner) = item {
                        let mut inner = inner.clone();
                        let mut noop = FollowUps::new();
                        attach_document(db, &mut inner, branches, resolved, 0, &mut noop)?;
                        apply_follow_ups(db, std::slice::from_mut(&mut inner), noop)?;
                        out.push(Value::Document(inner));
                    } else {
                        out.push(item.clone());
                    }
                }
                return Ok(Some(Value::Array(out)));
            }
            Ok(None)
        }
        FieldKind::List(Some(item_field)) => {
            if let Value::Array(items) = value {
                let mut out = Vec::with_capacity(items.len());
                let mut changed = false;
                for item in items {
                    match attach_value(db, item, item_field, branches, resolved)? {
                        Some(new_item) => {
                            changed = true;
                            out.push(new_item);
                        }
                        None => out.push(item.clone()),
                    }
                }
                return Ok(if changed { Some(Value::Array(out)) } else { None });
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn apply_follow_ups(db: &Database, docs: &mut [Document], follow_ups: FollowUps<'_>) -> Result<()> {
    for (attr, (tails, attached)) in follow_ups {
        let mut inner: Vec<Document> = attached.iter().map(|(_, d)| d.clone()).collect();
        run(db, &mut inner, &Some(tails))?;
        for ((index, _), resolved_doc) in attached.iter().zip(inner) {
            docs[*index].set(&attr, Value::Document(resolved_doc))?;
        }
    }
    Ok(())
}
