//! Database handle and per-schema collections.

use std::sync::Arc;

use log::debug;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::fields::FieldKind;
use crate::queryset::QuerySet;
use crate::schema::{Schema, SchemaRegistry, ID_WIRE_NAME};
use crate::storage::{Filter, FindOptions, Projection, Storage};
use crate::value::Value;

/// A storage backend paired with a schema registry. Cheap to clone; all
/// clones share both.
#[derive(Clone)]
pub struct Database {
    storage: Arc<dyn Storage>,
    registry: Arc<SchemaRegistry>,
}

impl Database {
    pub fn new(storage: Arc<dyn Storage>) -> Database {
        Database {
            storage,
            registry: Arc::new(SchemaRegistry::new()),
        }
    }

    pub fn with_registry(storage: Arc<dyn Storage>, registry: Arc<SchemaRegistry>) -> Database {
        Database { storage, registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn query(&self, schema: &Arc<Schema>) -> QuerySet {
        QuerySet::new(self.clone(), schema.clone())
    }

    pub fn collection(&self, schema: &Arc<Schema>) -> Result<Collection> {
        if schema.is_embedded() {
            return Err(Error::Operation(format!(
                "'{}' is embedded-only and has no collection",
                schema.name()
            )));
        }
        Ok(Collection {
            db: self.clone(),
            schema: schema.clone(),
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("registry", &self.registry)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Run the full validation pipeline before writing.
    pub validate: bool,
    /// Save unsaved referenced documents first.
    pub cascade: bool,
    /// Always insert, even when an identity is already assigned.
    pub force_insert: bool,
}

impl Default for SaveOptions {
    fn default() -> SaveOptions {
        SaveOptions {
            validate: true,
            cascade: false,
            force_insert: false,
        }
    }
}

/// Write-side operations for one schema family.
#[derive(Debug, Clone)]
pub struct Collection {
    db: Database,
    schema: Arc<Schema>,
}

impl Collection {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn query(&self) -> QuerySet {
        self.db.query(&self.schema)
    }

    pub fn save(&self, doc: &mut Document) -> Result<()> {
        self.save_with(doc, &SaveOptions::default())
    }

    /// Validate and persist. Documents without an identity are inserted and
    /// get their generated identity written back; documents with one are
    /// replaced wholesale (upsert, so an explicit identity inserts too).
    pub fn save_with(&self, doc: &mut Document, options: &SaveOptions) -> Result<()> {
        self.check_instance(doc)?;

        if options.cascade {
            self.cascade_save(doc, options)?;
        }
        if options.validate {
            doc.validate(&[])?;
        }

        let record = doc.to_record()?;
        let identity = record.get(ID_WIRE_NAME).cloned();
        match identity {
            Some(id) if !options.force_insert => {
                debug!("replace {} in '{}'", doc.schema().name(), self.schema.collection());
                let by_id = Filter::eq(ID_WIRE_NAME, id);
                self.db
                    .storage()
                    .replace_one(self.schema.collection(), &by_id, record, true)?;
            }
            _ => {
                debug!("insert {} into '{}'", doc.schema().name(), self.schema.collection());
                let mut ids =
                    self.db
                        .storage()
                        .insert_many(self.schema.collection(), vec![record])?;
                if let Some(id) = ids.pop() {
                    doc.set_identity(id)?;
                }
            }
        }
        Ok(())
    }

    /// Save every unsaved document reachable through reference fields, so
    /// the outer save's wire conversion finds them persisted.
    fn cascade_save(&self, doc: &mut Document, options: &SaveOptions) -> Result<()> {
        let fields: Vec<Arc<crate::fields::Field>> = doc.schema().fields().to_vec();
        for field in fields {
            if !matches!(field.kind(), FieldKind::Reference(..)) || !doc.is_set(field.name()) {
                continue;
            }
            if let Value::Document(mut inner) = doc.get(field.name())? {
                if inner.identity()?.is_none() {
                    let schema = inner.schema().clone();
                    self.db.collection(&schema)?.save_with(&mut inner, options)?;
                    doc.set(field.name(), Value::Document(inner))?;
                }
            }
        }
        Ok(())
    }

    /// Insert many documents in one storage call. Identities are written
    /// back in order.
    pub fn bulk_save(&self, docs: &mut [Document]) -> Result<Vec<Value>> {
        let mut records = Vec::with_capacity(docs.len());
        for doc in docs.iter_mut() {
            self.check_instance(doc)?;
            doc.validate(&[])?;
            records.push(doc.to_record()?);
        }
        let ids = self
            .db
            .storage()
            .insert_many(self.schema.collection(), records)?;
        for (doc, id) in docs.iter_mut().zip(ids.iter()) {
            doc.set_identity(id.clone())?;
        }
        Ok(ids)
    }

    /// Reload a saved document from storage, replacing its data. With a
    /// non-empty `fields` list only those attributes are fetched; everything
    /// else becomes unset.
    pub fn refresh(&self, doc: &mut Document, fields: &[&str]) -> Result<()> {
        let Some(identity) = doc.identity()? else {
            return Err(Error::Operation(
                "cannot refresh a document that has never been saved".to_string(),
            ));
        };
        let pk = doc.schema().identity_field().ok_or_else(|| {
            Error::Operation(format!("'{}' has no identity field", doc.schema().name()))
        })?;
        let wire_id = pk
            .to_wire(&identity, self.db.registry())
            .map_err(|msg| Error::validation_message(pk.name(), msg))?;

        let projection = if fields.is_empty() {
            Projection::All
        } else {
            Projection::Include(
                fields
                    .iter()
                    .map(|attr| {
                        doc.schema()
                            .field(attr)
                            .map(|f| f.wire_name().to_string())
                            .unwrap_or_else(|| attr.to_string())
                    })
                    .collect(),
            )
        };
        let options = FindOptions {
            limit: Some(1),
            projection,
            ..FindOptions::default()
        };
        let mut found = self.db.storage().find(
            self.schema.collection(),
            &Filter::eq(ID_WIRE_NAME, wire_id),
            &options,
        )?;
        let Some(record) = found.pop() else {
            return Err(Error::NotFound {
                schema: doc.schema().name().to_string(),
                collection: self.schema.collection().to_string(),
            });
        };
        *doc = Document::from_record(
            doc.schema().clone(),
            self.db.registry().clone(),
            record,
        )?;
        Ok(())
    }

    /// Delete one saved document, honoring delete rules.
    pub fn delete_one(&self, doc: &Document) -> Result<u64> {
        let Some(identity) = doc.identity()? else {
            return Err(Error::Operation(
                "cannot delete a document that has never been saved".to_string(),
            ));
        };
        let pk = doc.schema().identity_field().ok_or_else(|| {
            Error::Operation(format!("'{}' has no identity field", doc.schema().name()))
        })?;
        let wire_id = pk
            .to_wire(&identity, self.db.registry())
            .map_err(|msg| Error::validation_message(pk.name(), msg))?;
        self.query().filter(Filter::eq(ID_WIRE_NAME, wire_id)).delete()
    }

    /// Resolve reference fields in place. `None` follows every reference.
    pub fn dereference(&self, doc: &mut Document, paths: Option<&[String]>) -> Result<()> {
        crate::dereference::dereference(&self.db, doc, paths)
    }

    fn check_instance(&self, doc: &Document) -> Result<()> {
        if !self.schema.accepts_instance(doc.schema()) {
            return Err(Error::Operation(format!(
                "cannot store a '{}' document through the '{}' collection",
                doc.schema().name(),
                self.schema.name()
            )));
        }
        Ok(())
    }
}
