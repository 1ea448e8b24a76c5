//! Field descriptors: one typed converter + validator per document attribute.

pub mod validators;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::TimeZone;
use ulid::Ulid;
use uuid::Uuid;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::schema::{Schema, SchemaRegistry, ID_WIRE_NAME};
use crate::validation::{ErrorNode, ErrorTree};
use crate::value::{parse_datetime, Value};

pub use validators::Validator;

// Process-wide creation counter. Declaration order is preserved across
// inheritance merges by always ordering fields on this counter.
static CREATION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_counter() -> u64 {
    CREATION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What to do with dependent documents when a referenced document is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRule {
    DoNothing,
    /// Unset the referencing field.
    Nullify,
    /// Delete the referencing documents (recursively applying their rules).
    Cascade,
    /// Refuse the delete while referencing documents exist.
    Deny,
    /// Remove the identifier from a sequence-valued referencing field.
    Pull,
}

/// A schema referenced by a field: either resolved, or a forward reference by
/// name resolved lazily through the registry.
#[derive(Clone)]
pub enum TargetRef {
    Name(String),
    Schema(Arc<Schema>),
}

impl TargetRef {
    pub fn resolve(&self, registry: &SchemaRegistry) -> Result<Arc<Schema>> {
        match self {
            TargetRef::Schema(schema) => Ok(schema.clone()),
            TargetRef::Name(name) => registry.get(name),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, TargetRef::Schema(_))
    }
}

impl std::fmt::Debug for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetRef::Name(name) => write!(f, "TargetRef({name:?})"),
            TargetRef::Schema(schema) => write!(f, "TargetRef({:?})", schema.name()),
        }
    }
}

impl From<&str> for TargetRef {
    fn from(name: &str) -> Self {
        TargetRef::Name(name.to_string())
    }
}

impl From<String> for TargetRef {
    fn from(name: String) -> Self {
        TargetRef::Name(name)
    }
}

impl From<&Arc<Schema>> for TargetRef {
    fn from(schema: &Arc<Schema>) -> Self {
        TargetRef::Schema(schema.clone())
    }
}

impl From<Arc<Schema>> for TargetRef {
    fn from(schema: Arc<Schema>) -> Self {
        TargetRef::Schema(schema)
    }
}

/// The typed behavior of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// ULID identity values; the kind synthesized for implicit identities.
    Id,
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
    Bytes,
    Uuid,
    Email,
    Url,
    /// A free-form mapping.
    Dict,
    /// A sequence, optionally with a typed item descriptor.
    List(Option<Box<Field>>),
    /// A document stored inline.
    Embedded(TargetRef),
    /// A sequence of documents stored inline.
    EmbeddedList(TargetRef),
    /// A link to a document in another collection, persisted as the
    /// referenced schema's identity value.
    Reference(TargetRef, DeleteRule),
}

/// A lazily evaluated default: a literal, or a zero-argument producer.
#[derive(Clone)]
pub enum FieldDefault {
    Value(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl FieldDefault {
    fn produce(&self) -> Value {
        match self {
            FieldDefault::Value(v) => v.clone(),
            FieldDefault::Producer(f) => f(),
        }
    }
}

impl std::fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldDefault::Value(v) => write!(f, "FieldDefault::Value({v:?})"),
            FieldDefault::Producer(_) => write!(f, "FieldDefault::Producer(..)"),
        }
    }
}

/// A single field descriptor. Constructed through the per-kind constructors
/// (`Field::string`, `Field::reference`, ...) and the chainable options.
#[derive(Clone)]
pub struct Field {
    name: String,
    wire_name: Option<String>,
    kind: FieldKind,
    primary_key: bool,
    required: bool,
    blank: bool,
    default: Option<FieldDefault>,
    choices: Option<Vec<(Value, String)>>,
    validators: Vec<Validator>,
    counter: u64,
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name)
            .field("kind", &self.kind)
            .field("primary_key", &self.primary_key)
            .field("required", &self.required)
            .field("blank", &self.blank)
            .field("counter", &self.counter)
            .finish()
    }
}

impl Field {
    fn new(name: &str, kind: FieldKind) -> Field {
        Field {
            name: name.to_string(),
            wire_name: None,
            kind,
            primary_key: false,
            required: false,
            blank: false,
            default: None,
            choices: None,
            validators: Vec::new(),
            counter: next_counter(),
        }
    }

    pub fn id(name: &str) -> Field {
        Field::new(name, FieldKind::Id)
    }

    pub fn string(name: &str) -> Field {
        Field::new(name, FieldKind::String)
    }

    pub fn integer(name: &str) -> Field {
        Field::new(name, FieldKind::Integer)
    }

    pub fn float(name: &str) -> Field {
        Field::new(name, FieldKind::Float)
    }

    pub fn boolean(name: &str) -> Field {
        Field::new(name, FieldKind::Boolean)
    }

    pub fn datetime(name: &str) -> Field {
        Field::new(name, FieldKind::DateTime)
    }

    pub fn bytes(name: &str) -> Field {
        Field::new(name, FieldKind::Bytes)
    }

    pub fn uuid(name: &str) -> Field {
        Field::new(name, FieldKind::Uuid)
    }

    pub fn email(name: &str) -> Field {
        let mut field = Field::new(name, FieldKind::Email);
        field.validators.push(validators::email());
        field
    }

    pub fn url(name: &str) -> Field {
        let mut field = Field::new(name, FieldKind::Url);
        field.validators.push(validators::url());
        field
    }

    pub fn dict(name: &str) -> Field {
        Field::new(name, FieldKind::Dict)
    }

    pub fn list(name: &str, item: Option<Field>) -> Field {
        Field::new(name, FieldKind::List(item.map(Box::new)))
    }

    pub fn embedded(name: &str, target: impl Into<TargetRef>) -> Field {
        Field::new(name, FieldKind::Embedded(target.into()))
    }

    pub fn embedded_list(name: &str, target: impl Into<TargetRef>) -> Field {
        Field::new(name, FieldKind::EmbeddedList(target.into()))
    }

    pub fn reference(name: &str, target: impl Into<TargetRef>) -> Field {
        Field::new(
            name,
            FieldKind::Reference(target.into(), DeleteRule::DoNothing),
        )
    }

    // ── Chainable options ────────────────────────────────────────────

    pub fn required(mut self) -> Field {
        self.required = true;
        self
    }

    /// Allow blank values (empty string/sequence/mapping, null).
    pub fn blank(mut self) -> Field {
        self.blank = true;
        self
    }

    pub fn primary_key(mut self) -> Field {
        self.primary_key = true;
        self
    }

    /// Override the name this field is stored under. The identity field's
    /// wire name is fixed to the reserved token and cannot be overridden.
    pub fn store_as(mut self, wire_name: &str) -> Field {
        self.wire_name = Some(wire_name.to_string());
        self
    }

    pub fn default_value(mut self, value: Value) -> Field {
        self.default = Some(FieldDefault::Value(value));
        self
    }

    pub fn default_with(mut self, producer: impl Fn() -> Value + Send + Sync + 'static) -> Field {
        self.default = Some(FieldDefault::Producer(Arc::new(producer)));
        self
    }

    /// Restrict the field to a flat set of allowed values.
    pub fn choices(mut self, choices: impl IntoIterator<Item = Value>) -> Field {
        self.choices = Some(
            choices
                .into_iter()
                .map(|v| {
                    let label = format!("{v:?}");
                    (v, label)
                })
                .collect(),
        );
        self
    }

    /// Restrict the field to (value, human-label) pairs. Membership is
    /// checked against the value side only.
    pub fn choices_labeled(
        mut self,
        choices: impl IntoIterator<Item = (Value, String)>,
    ) -> Field {
        self.choices = Some(choices.into_iter().collect());
        self
    }

    pub fn validator(mut self, validator: Validator) -> Field {
        self.validators.push(validator);
        self
    }

    pub fn min_value(mut self, min: f64) -> Field {
        self.validators.push(validators::min_max(Some(min), None));
        self
    }

    pub fn max_value(mut self, max: f64) -> Field {
        self.validators.push(validators::min_max(None, Some(max)));
        self
    }

    pub fn min_length(mut self, min: usize) -> Field {
        self.validators.push(validators::length(Some(min), None));
        self
    }

    pub fn max_length(mut self, max: usize) -> Field {
        self.validators.push(validators::length(None, Some(max)));
        self
    }

    /// Set the delete rule on a reference field. Checked at schema build
    /// time: a rule other than `DoNothing` requires a resolved target schema.
    pub fn on_delete(mut self, rule: DeleteRule) -> Field {
        if let FieldKind::Reference(_, r) = &mut self.kind {
            *r = rule;
        }
        self
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The storage-side name. Falls back to the attribute name; `finalized`
    /// pins identity fields to the reserved token.
    pub fn wire_name(&self) -> &str {
        self.wire_name.as_deref().unwrap_or(&self.name)
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn allows_blank(&self) -> bool {
        self.blank
    }

    pub fn creation_order(&self) -> u64 {
        self.counter
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn produce_default(&self) -> Option<Value> {
        self.default.as_ref().map(FieldDefault::produce)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference(..))
    }

    pub fn reference_target(&self) -> Option<&TargetRef> {
        match &self.kind {
            FieldKind::Reference(target, _) => Some(target),
            _ => None,
        }
    }

    pub fn delete_rule(&self) -> Option<DeleteRule> {
        match &self.kind {
            FieldKind::Reference(_, rule) => Some(*rule),
            _ => None,
        }
    }

    /// Resolve the effective wire name and enforce the identity invariants.
    /// Called once per field when a schema is built; the returned copy is the
    /// one the schema owns.
    pub(crate) fn finalized(&self) -> Result<Field> {
        let mut field = self.clone();
        if field.primary_key {
            match field.wire_name.as_deref() {
                None => field.wire_name = Some(ID_WIRE_NAME.to_string()),
                Some(ID_WIRE_NAME) => {}
                Some(other) => {
                    return Err(Error::Definition(format!(
                        "the wire name of an identity field must be '{ID_WIRE_NAME}', not '{other}'"
                    )))
                }
            }
        } else if field.wire_name() == ID_WIRE_NAME {
            return Err(Error::Definition(format!(
                "field '{}' may not use the reserved wire name '{ID_WIRE_NAME}'",
                field.name
            )));
        }
        Ok(field)
    }

    // ── Conversion pipeline ──────────────────────────────────────────

    /// Convert a raw stored value to its canonical in-memory form. Idempotent:
    /// an already-canonical value comes back unchanged. Never touches storage.
    pub fn to_canonical(
        &self,
        value: &Value,
        registry: &Arc<SchemaRegistry>,
    ) -> std::result::Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match &self.kind {
            FieldKind::Id => match value {
                Value::Id(_) => Ok(value.clone()),
                Value::String(s) => Ulid::from_string(s)
                    .map(Value::Id)
                    .map_err(|_| format!("'{s}' is not a valid identifier")),
                other => Err(format!("cannot convert {} to an identifier", other.type_name())),
            },
            FieldKind::String | FieldKind::Email | FieldKind::Url => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Int(i) => Ok(Value::String(i.to_string())),
                Value::Float(f) => Ok(Value::String(f.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                Value::Id(id) => Ok(Value::String(id.to_string())),
                Value::Uuid(u) => Ok(Value::String(u.to_string())),
                other => Err(format!("cannot convert {} to a string", other.type_name())),
            },
            FieldKind::Integer => match value {
                Value::Int(_) => Ok(value.clone()),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| format!("'{s}' is not a valid integer")),
                other => Err(format!("cannot convert {} to an integer", other.type_name())),
            },
            FieldKind::Float => match value {
                Value::Float(_) => Ok(value.clone()),
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::String(s) => s
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("'{s}' is not a valid float")),
                other => Err(format!("cannot convert {} to a float", other.type_name())),
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Int(i) => Ok(Value::Bool(*i != 0)),
                other => Err(format!("cannot convert {} to a boolean", other.type_name())),
            },
            FieldKind::DateTime => match value {
                Value::DateTime(_) => Ok(value.clone()),
                Value::String(s) => parse_datetime(s)
                    .map(Value::DateTime)
                    .ok_or_else(|| format!("'{s}' cannot be converted to a datetime")),
                Value::Int(secs) => chrono::Utc
                    .timestamp_opt(*secs, 0)
                    .single()
                    .map(Value::DateTime)
                    .ok_or_else(|| format!("{secs} is out of range for a datetime")),
                other => Err(format!("cannot convert {} to a datetime", other.type_name())),
            },
            FieldKind::Bytes => match value {
                Value::Bytes(_) => Ok(value.clone()),
                other => Err(format!("cannot convert {} to bytes", other.type_name())),
            },
            FieldKind::Uuid => match value {
                Value::Uuid(_) => Ok(value.clone()),
                Value::String(s) => Uuid::parse_str(s)
                    .map(Value::Uuid)
                    .map_err(|_| format!("'{s}' is not a valid UUID")),
                other => Err(format!("cannot convert {} to a UUID", other.type_name())),
            },
            FieldKind::Dict => match value {
                Value::Object(_) => Ok(value.clone()),
                other => Err(format!("cannot convert {} to a mapping", other.type_name())),
            },
            FieldKind::List(item) => match value {
                Value::Array(items) => {
                    let converted = match item {
                        Some(item_field) => items
                            .iter()
                            .map(|v| item_field.to_canonical(v, registry))
                            .collect::<std::result::Result<Vec<_>, _>>()?,
                        None => items.clone(),
                    };
                    Ok(Value::Array(converted))
                }
                other => Err(format!("cannot convert {} to a list", other.type_name())),
            },
            FieldKind::Embedded(target) => {
                let schema = target
                    .resolve(registry)
                    .map_err(|e| e.to_string())?;
                match value {
                    Value::Document(doc) if schema.accepts_instance(doc.schema()) => {
                        Ok(value.clone())
                    }
                    Value::Document(doc) => Err(format!(
                        "value must be a {} document, not {}",
                        schema.name(),
                        doc.schema().name()
                    )),
                    Value::Object(map) => {
                        let doc = Document::from_record(schema, registry.clone(), map.clone())
                            .map_err(|e| e.to_string())?;
                        Ok(Value::Document(doc))
                    }
                    other => Err(format!(
                        "cannot convert {} to an embedded document",
                        other.type_name()
                    )),
                }
            }
            FieldKind::EmbeddedList(target) => match value {
                Value::Array(items) => {
                    let item_field = Field::embedded(&self.name, target.clone());
                    let converted = items
                        .iter()
                        .map(|v| item_field.to_canonical(v, registry))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(Value::Array(converted))
                }
                other => Err(format!("cannot convert {} to a list", other.type_name())),
            },
            FieldKind::Reference(target, _) => {
                let schema = target.resolve(registry).map_err(|e| e.to_string())?;
                match value {
                    Value::Document(doc) if schema.accepts_instance(doc.schema()) => {
                        Ok(value.clone())
                    }
                    Value::Document(doc) => Err(format!(
                        "value must be a {} document, not {}",
                        schema.name(),
                        doc.schema().name()
                    )),
                    Value::Object(map) => {
                        // Either an inline copy of the referenced document, or
                        // a composite identity value. Try the former, keep the
                        // latter as-is.
                        match Document::from_record(schema, registry.clone(), map.clone()) {
                            Ok(doc) => Ok(Value::Document(doc)),
                            Err(_) => Ok(value.clone()),
                        }
                    }
                    other => {
                        let pk = schema.identity_field().ok_or_else(|| {
                            format!("{} has no identity field", schema.name())
                        })?;
                        pk.to_canonical(other, registry)
                    }
                }
            }
        }
    }

    /// Convert a value to its wire/storage form. Embedded documents become
    /// nested mappings; references become the target's identity value.
    pub fn to_wire(
        &self,
        value: &Value,
        registry: &Arc<SchemaRegistry>,
    ) -> std::result::Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match &self.kind {
            FieldKind::Embedded(_) => {
                let canonical = self.to_canonical(value, registry)?;
                match canonical {
                    Value::Document(doc) => {
                        Ok(Value::Object(doc.to_record().map_err(|e| e.to_string())?))
                    }
                    other => Ok(other),
                }
            }
            FieldKind::EmbeddedList(target) => {
                let item_field = Field::embedded(&self.name, target.clone());
                match value {
                    Value::Array(items) => {
                        let out = items
                            .iter()
                            .map(|v| item_field.to_wire(v, registry))
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        Ok(Value::Array(out))
                    }
                    other => Err(format!("cannot convert {} to a list", other.type_name())),
                }
            }
            FieldKind::Reference(target, _) => {
                let schema = target.resolve(registry).map_err(|e| e.to_string())?;
                let pk = schema
                    .identity_field()
                    .ok_or_else(|| format!("{} has no identity field", schema.name()))?;
                match value {
                    Value::Document(doc) => match doc.identity().map_err(|e| e.to_string())? {
                        Some(id) => pk.to_wire(&id, registry),
                        None => Err(
                            "referenced documents must be saved to the database first".to_string()
                        ),
                    },
                    other => pk.to_wire(other, registry),
                }
            }
            FieldKind::List(item) => match (value, item) {
                (Value::Array(items), Some(item_field)) => {
                    let out = items
                        .iter()
                        .map(|v| item_field.to_wire(v, registry))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(Value::Array(out))
                }
                _ => self.to_canonical(value, registry),
            },
            _ => self.to_canonical(value, registry),
        }
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Validate an already-canonical value. Blank and choice violations stop
    /// the pipeline for this field; attached validators all run, and every
    /// failure is collected.
    pub fn validate(
        &self,
        value: &Value,
        registry: &Arc<SchemaRegistry>,
    ) -> std::result::Result<(), Vec<ErrorNode>> {
        if !self.blank && value.is_blank() {
            return Err(vec![ErrorNode::Message(format!(
                "must not be blank (was: {value:?})"
            ))]);
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|(allowed, _)| allowed == value) {
                let allowed: Vec<&Value> = choices.iter().map(|(v, _)| v).collect();
                return Err(vec![ErrorNode::Message(format!(
                    "{value:?} is not a choice. Choices are {allowed:?}."
                ))]);
            }
        }

        let mut errors: Vec<ErrorNode> = Vec::new();

        match &self.kind {
            FieldKind::Embedded(_) => {
                if let Value::Document(doc) = value {
                    match doc.clone().validate(&[]) {
                        Ok(()) => {}
                        Err(Error::Validation(tree)) => errors.push(ErrorNode::Nested(tree)),
                        Err(other) => errors.push(ErrorNode::Message(other.to_string())),
                    }
                }
            }
            FieldKind::EmbeddedList(_) => {
                if let Value::Array(items) = value {
                    for (index, item) in items.iter().enumerate() {
                        if let Value::Document(doc) = item {
                            let node = match doc.clone().validate(&[]) {
                                Ok(()) => continue,
                                Err(Error::Validation(tree)) => ErrorNode::Nested(tree),
                                Err(other) => ErrorNode::Message(other.to_string()),
                            };
                            let mut indexed = ErrorTree::new();
                            indexed.push_node(&index.to_string(), node);
                            errors.push(ErrorNode::Nested(indexed));
                        }
                    }
                }
            }
            FieldKind::Reference(..) => {
                // The wire conversion enforces that referenced documents are
                // persisted and that the identity is well-formed.
                if let Err(message) = self.to_wire(value, registry) {
                    errors.push(ErrorNode::Message(message));
                }
            }
            FieldKind::List(Some(item_field)) => {
                if let Value::Array(items) = value {
                    for (index, item) in items.iter().enumerate() {
                        if let Err(nodes) = item_field.validate(item, registry) {
                            for node in nodes {
                                match node {
                                    ErrorNode::Message(msg) => errors.push(ErrorNode::Message(
                                        format!("item {index}: {msg}"),
                                    )),
                                    nested => errors.push(nested),
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        for validator in &self.validators {
            if let Err(message) = validator(value) {
                errors.push(ErrorNode::Message(message));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
