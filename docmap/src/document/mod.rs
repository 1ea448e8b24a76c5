//! Documents: schema-described values with lazy conversion to canonical form.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::{Schema, SchemaRegistry, TYPE_TAG};
use crate::validation::{ErrorTree, NON_FIELD_ERRORS};
use crate::value::{Record, Value};

/// One stored attribute. Values arrive raw (from user writes or storage) and
/// are converted to their canonical form on first access; a write replaces
/// the slot, discarding any cached conversion.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Raw(Value),
    Converted(Value),
}

/// An instance of a schema. Attribute access goes through the schema's field
/// descriptors; `validate` runs the full pipeline before a save does.
#[derive(Clone)]
pub struct Document {
    schema: Arc<Schema>,
    registry: Arc<SchemaRegistry>,
    data: BTreeMap<String, Slot>,
}

impl Document {
    pub fn new(schema: &Arc<Schema>, registry: &Arc<SchemaRegistry>) -> Document {
        Document {
            schema: schema.clone(),
            registry: registry.clone(),
            data: BTreeMap::new(),
        }
    }

    /// Materialize a document from its stored record. Honors the type tag:
    /// a record tagged with a registered subtype comes back as that subtype.
    pub fn from_record(
        schema: Arc<Schema>,
        registry: Arc<SchemaRegistry>,
        record: Record,
    ) -> Result<Document> {
        let schema = match record.get(TYPE_TAG) {
            Some(Value::String(tag)) if tag != schema.name() => {
                let tagged = registry.get(tag)?;
                if !schema.accepts_instance(&tagged) {
                    return Err(Error::Operation(format!(
                        "record is tagged '{}', which is not a kind of '{}'",
                        tag,
                        schema.name()
                    )));
                }
                tagged
            }
            _ => schema,
        };

        let mut data = BTreeMap::new();
        for (wire, value) in record {
            if wire == TYPE_TAG {
                continue;
            }
            if schema.field_by_wire(&wire).is_some() {
                data.insert(wire, Slot::Raw(value));
            } else if !schema.ignores_unknown_fields() {
                return Err(Error::Operation(format!(
                    "'{}' has no field stored as '{}'",
                    schema.name(),
                    wire
                )));
            }
        }
        Ok(Document {
            schema,
            registry,
            data,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Assign a raw value. Converted lazily on the next read.
    pub fn set(&mut self, attr: &str, value: Value) -> Result<()> {
        let field = self
            .schema
            .field(attr)
            .ok_or_else(|| Error::Operation(self.unknown_attr(attr)))?;
        self.data
            .insert(field.wire_name().to_string(), Slot::Raw(value));
        Ok(())
    }

    pub fn unset(&mut self, attr: &str) -> Result<()> {
        let field = self
            .schema
            .field(attr)
            .ok_or_else(|| Error::Operation(self.unknown_attr(attr)))?;
        self.data.remove(field.wire_name());
        Ok(())
    }

    pub fn is_set(&self, attr: &str) -> bool {
        self.schema
            .field(attr)
            .is_some_and(|f| self.data.contains_key(f.wire_name()))
    }

    /// Read an attribute, converting and caching the canonical form. Unset
    /// attributes yield the field default (never cached, so an unset field
    /// stays unset) or null.
    pub fn get(&mut self, attr: &str) -> Result<Value> {
        let field = self
            .schema
            .field(attr)
            .ok_or_else(|| Error::Operation(self.unknown_attr(attr)))?
            .clone();
        let wire = field.wire_name().to_string();
        match self.data.get(&wire) {
            Some(Slot::Converted(value)) => Ok(value.clone()),
            Some(Slot::Raw(raw)) => {
                let converted = field
                    .to_canonical(raw, &self.registry)
                    .map_err(|msg| Error::validation_message(attr, &msg))?;
                self.data
                    .insert(wire, Slot::Converted(converted.clone()));
                Ok(converted)
            }
            None => self.default_for(&field, attr),
        }
    }

    /// Read-only variant of `get` for shared contexts; converts without
    /// caching.
    pub fn value(&self, attr: &str) -> Result<Value> {
        let field = self
            .schema
            .field(attr)
            .ok_or_else(|| Error::Operation(self.unknown_attr(attr)))?;
        match self.data.get(field.wire_name()) {
            Some(Slot::Converted(value)) => Ok(value.clone()),
            Some(Slot::Raw(raw)) => field
                .to_canonical(raw, &self.registry)
                .map_err(|msg| Error::validation_message(attr, &msg)),
            None => self.default_for(field, attr),
        }
    }

    fn default_for(&self, field: &crate::fields::Field, attr: &str) -> Result<Value> {
        match field.produce_default() {
            Some(default) => field
                .to_canonical(&default, &self.registry)
                .map_err(|msg| Error::validation_message(attr, &msg)),
            None => Ok(Value::Null),
        }
    }

    /// The identity value, or `None` while the document is unsaved.
    pub fn identity(&self) -> Result<Option<Value>> {
        let Some(pk) = self.schema.identity_field() else {
            return Ok(None);
        };
        if !self.data.contains_key(pk.wire_name()) {
            return Ok(None);
        }
        let value = self.value(pk.name())?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    pub fn set_identity(&mut self, value: Value) -> Result<()> {
        let pk = self.schema.identity_field().ok_or_else(|| {
            Error::Operation(format!("'{}' has no identity field", self.schema.name()))
        })?;
        self.data
            .insert(pk.wire_name().to_string(), Slot::Raw(value));
        Ok(())
    }

    /// Convert every set attribute to canonical form in place. Failures are
    /// aggregated per attribute.
    pub fn ensure_converted(&mut self) -> Result<()> {
        let mut tree = ErrorTree::new();
        let fields: Vec<Arc<crate::fields::Field>> = self.schema.fields().to_vec();
        for field in fields {
            if !self.data.contains_key(field.wire_name()) {
                continue;
            }
            match self.get(field.name()) {
                Ok(_) => {}
                Err(Error::Validation(sub)) => tree.merge(sub),
                Err(other) => return Err(other),
            }
        }
        if tree.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(tree))
        }
    }

    /// The wire form of the document. Unset attributes are omitted (defaults
    /// are an access-time affordance, never persisted); non-final schemas
    /// carry a type tag.
    pub fn to_record(&self) -> Result<Record> {
        let mut record = Record::new();
        let mut tree = ErrorTree::new();
        if self.schema.writes_type_tag() {
            record.insert(
                TYPE_TAG.to_string(),
                Value::String(self.schema.name().to_string()),
            );
        }
        for field in self.schema.fields() {
            let Some(slot) = self.data.get(field.wire_name()) else {
                continue;
            };
            let value = match slot {
                Slot::Raw(v) | Slot::Converted(v) => v,
            };
            match field.to_wire(value, &self.registry) {
                Ok(wire_value) => {
                    record.insert(field.wire_name().to_string(), wire_value);
                }
                Err(msg) => tree.push_message(field.name(), &msg),
            }
        }
        if tree.is_empty() {
            Ok(record)
        } else {
            Err(Error::Validation(tree))
        }
    }

    /// Run the full validation pipeline: per-field conversion and validation
    /// with all failures aggregated, then the schema's object-level hook
    /// (only once every field passed). Attributes named in `exclude` are
    /// skipped.
    pub fn validate(&mut self, exclude: &[&str]) -> Result<()> {
        let mut tree = ErrorTree::new();
        let fields: Vec<Arc<crate::fields::Field>> = self.schema.fields().to_vec();

        for field in &fields {
            if exclude.contains(&field.name()) {
                continue;
            }
            if !self.data.contains_key(field.wire_name()) {
                // A default does not satisfy `required`: the attribute was
                // never assigned.
                if field.is_required() {
                    tree.push_message(field.name(), "this field is required");
                }
                continue;
            }
            // Convert exactly once; validators always see canonical values.
            let canonical = match self.get(field.name()) {
                Ok(value) => value,
                Err(Error::Validation(sub)) => {
                    tree.merge(sub);
                    continue;
                }
                Err(other) => return Err(other),
            };
            // Blank-allowed fields skip validators for blank values; the
            // blank check inside `Field::validate` covers the rest.
            if canonical.is_blank() && field.allows_blank() {
                continue;
            }
            if let Err(nodes) = field.validate(&canonical, &self.registry) {
                for node in nodes {
                    tree.push_node(field.name(), node);
                }
            }
        }

        if !tree.is_empty() {
            return Err(Error::Validation(tree));
        }

        let schema = self.schema.clone();
        if let Err(message) = schema.run_clean(self) {
            let mut tree = ErrorTree::new();
            tree.push_message(NON_FIELD_ERRORS, &message);
            return Err(Error::Validation(tree));
        }
        Ok(())
    }

    /// `true` when `validate` would pass.
    pub fn is_valid(&mut self) -> bool {
        self.validate(&[]).is_ok()
    }

    fn unknown_attr(&self, attr: &str) -> String {
        format!("'{}' has no field named '{attr}'", self.schema.name())
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("schema", &self.schema.name())
            .field("data", &self.data)
            .finish()
    }
}

impl PartialEq for Document {
    /// Saved documents compare by identity; unsaved ones structurally.
    fn eq(&self, other: &Self) -> bool {
        if self.schema.name() != other.schema.name() {
            return false;
        }
        match (self.identity(), other.identity()) {
            (Ok(Some(a)), Ok(Some(b))) => a == b,
            _ => self.data == other.data,
        }
    }
}
