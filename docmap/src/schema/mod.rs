//! Schema composition: named field sets, inheritance, identity, type tags.

pub mod registry;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::fields::{DeleteRule, Field, FieldKind};

pub use registry::SchemaRegistry;

/// Reserved wire name for the identity field.
pub const ID_WIRE_NAME: &str = "_id";
/// Wire name of the polymorphism tag stored alongside documents.
pub const TYPE_TAG: &str = "_cls";

/// Object-level hook run after per-field validation succeeds.
pub type CleanFn = Arc<dyn Fn(&mut Document) -> std::result::Result<(), String> + Send + Sync>;

/// A dependent schema's reference into this one, recorded so deletes know
/// which documents to inspect. `field` is the dependent's attribute name.
#[derive(Debug, Clone)]
pub struct DeleteRuleEntry {
    pub dependent: String,
    pub field: String,
    pub rule: DeleteRule,
}

/// An immutable, registry-registered description of one document type.
pub struct Schema {
    name: String,
    collection: String,
    fields: Vec<Arc<Field>>,
    by_attr: HashMap<String, usize>,
    by_wire: HashMap<String, usize>,
    pk: Option<usize>,
    implicit_id: bool,
    parents: Vec<Arc<Schema>>,
    final_: bool,
    embedded: bool,
    ignore_unknown_fields: bool,
    clean: Option<CleanFn>,
    // Filled in after construction: descendants register themselves here,
    // and dependents register delete rules here.
    subtypes: RwLock<BTreeSet<String>>,
    delete_rules: RwLock<Vec<DeleteRuleEntry>>,
}

impl Schema {
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: name.to_string(),
            collection: None,
            parents: Vec::new(),
            fields: Vec::new(),
            final_: false,
            embedded: false,
            ignore_unknown_fields: false,
            clean: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_final(&self) -> bool {
        self.final_
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn ignores_unknown_fields(&self) -> bool {
        self.ignore_unknown_fields
    }

    /// Fields in declaration order (creation counter), parents first.
    pub fn fields(&self) -> &[Arc<Field>] {
        &self.fields
    }

    pub fn field(&self, attr: &str) -> Option<&Arc<Field>> {
        self.by_attr.get(attr).map(|&i| &self.fields[i])
    }

    pub fn field_by_wire(&self, wire: &str) -> Option<&Arc<Field>> {
        self.by_wire.get(wire).map(|&i| &self.fields[i])
    }

    pub fn identity_field(&self) -> Option<&Arc<Field>> {
        self.pk.map(|i| &self.fields[i])
    }

    pub fn has_implicit_id(&self) -> bool {
        self.implicit_id
    }

    pub fn parents(&self) -> &[Arc<Schema>] {
        &self.parents
    }

    /// Documents of final schemas are stored without a type tag.
    pub fn writes_type_tag(&self) -> bool {
        !self.final_
    }

    fn read_subtypes(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        self.subtypes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subtypes(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.subtypes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when a document of `other` may stand where this schema is
    /// expected: `other` is this schema or a registered descendant.
    pub fn accepts_instance(&self, other: &Schema) -> bool {
        other.name == self.name || self.read_subtypes().contains(&other.name)
    }

    /// This schema's name plus its descendants', sorted. The set of type-tag
    /// values a query for this schema matches.
    pub fn instance_names(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        names.extend(self.read_subtypes().iter().cloned());
        names.sort();
        names
    }

    pub fn subtype_names(&self) -> Vec<String> {
        self.read_subtypes().iter().cloned().collect()
    }

    pub(crate) fn add_subtype(&self, name: &str) {
        self.write_subtypes().insert(name.to_string());
    }

    pub fn delete_rules(&self) -> Vec<DeleteRuleEntry> {
        self.delete_rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn add_delete_rule(&self, entry: DeleteRuleEntry) {
        self.delete_rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub(crate) fn run_clean(&self, doc: &mut Document) -> std::result::Result<(), String> {
        match &self.clean {
            Some(hook) => hook(doc),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field(
                "fields",
                &self.fields.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("final", &self.final_)
            .field("embedded", &self.embedded)
            .finish()
    }
}

pub struct SchemaBuilder {
    name: String,
    collection: Option<String>,
    parents: Vec<Arc<Schema>>,
    fields: Vec<Field>,
    final_: bool,
    embedded: bool,
    ignore_unknown_fields: bool,
    clean: Option<CleanFn>,
}

impl SchemaBuilder {
    /// Inherit another schema's fields. May be called more than once; fields
    /// merge in creation order across all parents.
    pub fn extend(mut self, parent: &Arc<Schema>) -> SchemaBuilder {
        self.parents.push(parent.clone());
        self
    }

    pub fn collection(mut self, name: &str) -> SchemaBuilder {
        self.collection = Some(name.to_string());
        self
    }

    pub fn field(mut self, field: Field) -> SchemaBuilder {
        self.fields.push(field);
        self
    }

    /// Forbid further extension; documents are stored without a type tag.
    pub fn final_(mut self) -> SchemaBuilder {
        self.final_ = true;
        self
    }

    /// Mark as embedded-only: no identity, no collection of its own.
    pub fn embedded(mut self) -> SchemaBuilder {
        self.embedded = true;
        self
    }

    /// Drop unknown wire names when materializing stored records instead of
    /// failing.
    pub fn ignore_unknown_fields(mut self) -> SchemaBuilder {
        self.ignore_unknown_fields = true;
        self
    }

    pub fn clean(
        mut self,
        hook: impl Fn(&mut Document) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> SchemaBuilder {
        self.clean = Some(Arc::new(hook));
        self
    }

    pub fn build(self, registry: &SchemaRegistry) -> Result<Arc<Schema>> {
        for parent in &self.parents {
            if parent.final_ {
                return Err(Error::Definition(format!(
                    "'{}' cannot extend final schema '{}'",
                    self.name, parent.name
                )));
            }
            if parent.embedded != self.embedded {
                return Err(Error::Definition(format!(
                    "'{}' cannot extend '{}': embedded and top-level schemas do not mix",
                    self.name, parent.name
                )));
            }
        }

        // Merge parent fields first, then own declarations. A redeclared
        // attribute replaces the inherited one; insertion is always by
        // creation counter, never a re-sort.
        let mut fields: Vec<Field> = Vec::new();
        for parent in &self.parents {
            for field in &parent.fields {
                merge_field(&mut fields, (**field).clone())?;
            }
        }
        for field in self.fields {
            merge_field(&mut fields, field.finalized()?)?;
        }

        // An explicit identity displaces an inherited implicit one.
        let implicit_pk_names: BTreeSet<&str> = self
            .parents
            .iter()
            .filter(|p| p.implicit_id)
            .filter_map(|p| p.identity_field().map(|f| f.name()))
            .collect();
        let pk_count = fields.iter().filter(|f| f.is_primary_key()).count();
        if pk_count > 1 {
            fields.retain(|f| !(f.is_primary_key() && implicit_pk_names.contains(f.name())));
        }
        if fields.iter().filter(|f| f.is_primary_key()).count() > 1 {
            return Err(Error::Definition(format!(
                "'{}' declares more than one identity field",
                self.name
            )));
        }

        let implicit_id = if !self.embedded && !fields.iter().any(|f| f.is_primary_key()) {
            merge_field(&mut fields, Field::id("id").primary_key().finalized()?)?;
            true
        } else {
            // An identity inherited from a parent that synthesized it stays
            // implicit, so a later descendant may still displace it.
            fields
                .iter()
                .any(|f| f.is_primary_key() && implicit_pk_names.contains(f.name()))
        };

        let fields: Vec<Arc<Field>> = fields.into_iter().map(Arc::new).collect();
        let mut by_attr = HashMap::new();
        let mut by_wire = HashMap::new();
        let mut pk = None;
        for (index, field) in fields.iter().enumerate() {
            by_attr.insert(field.name().to_string(), index);
            by_wire.insert(field.wire_name().to_string(), index);
            if field.is_primary_key() {
                pk = Some(index);
            }
        }

        let collection = match &self.collection {
            Some(name) => name.clone(),
            // Single-collection inheritance: children land in the parent's
            // collection unless told otherwise.
            None => match self.parents.first() {
                Some(parent) => parent.collection.clone(),
                None => to_snake_case(short_name(&self.name)),
            },
        };

        let schema = Arc::new(Schema {
            name: self.name,
            collection,
            fields,
            by_attr,
            by_wire,
            pk,
            implicit_id,
            parents: self.parents,
            final_: self.final_,
            embedded: self.embedded,
            ignore_unknown_fields: self.ignore_unknown_fields,
            clean: self.clean,
            subtypes: RwLock::new(BTreeSet::new()),
            delete_rules: RwLock::new(Vec::new()),
        });

        registry.register(schema.clone())?;

        for ancestor in transitive_ancestors(&schema.parents) {
            ancestor.add_subtype(&schema.name);
        }

        // Delete rules hang off the referenced schema; a rule on a target
        // not yet registered cannot be honored, so it is rejected here.
        // References nested one level inside a list register under the list
        // field's name.
        for field in &schema.fields {
            let reference = match field.kind() {
                FieldKind::Reference(target, rule) => Some((target, rule)),
                FieldKind::List(Some(item)) => match item.kind() {
                    FieldKind::Reference(target, rule) => Some((target, rule)),
                    _ => None,
                },
                _ => None,
            };
            if let Some((target, rule)) = reference {
                if *rule != DeleteRule::DoNothing {
                    let target = target.resolve(registry).map_err(|_| {
                        Error::Definition(format!(
                            "field '{}' of '{}' sets a delete rule on an unregistered target",
                            field.name(),
                            schema.name
                        ))
                    })?;
                    registry.register_delete_rule(
                        target.name(),
                        &schema.name,
                        field.name(),
                        *rule,
                    )?;
                }
            }
        }

        Ok(schema)
    }
}

fn merge_field(fields: &mut Vec<Field>, field: Field) -> Result<()> {
    if let Some(pos) = fields.iter().position(|f| f.name() == field.name()) {
        fields.remove(pos);
    }
    // Checked after any same-name removal: a redeclared attribute may keep
    // its old wire name, but must not collide with a different sibling.
    if let Some(other) = fields.iter().find(|f| f.wire_name() == field.wire_name()) {
        return Err(Error::Definition(format!(
            "field '{}' cannot be stored under '{}': already used by field '{}'",
            field.name(),
            field.wire_name(),
            other.name()
        )));
    }
    let at = fields.partition_point(|f| f.creation_order() < field.creation_order());
    fields.insert(at, field);
    Ok(())
}

fn transitive_ancestors(parents: &[Arc<Schema>]) -> Vec<Arc<Schema>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<Arc<Schema>> = parents.to_vec();
    while let Some(schema) = stack.pop() {
        if seen.insert(schema.name().to_string()) {
            stack.extend(schema.parents.iter().cloned());
            out.push(schema);
        }
    }
    out
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snake_case_collection_names() {
        assert_eq!(to_snake_case("Post"), "post");
        assert_eq!(to_snake_case("BlogPost"), "blog_post");
        assert_eq!(short_name("blog.BlogPost"), "BlogPost");
    }

    #[test]
    fn test_fields_keep_declaration_order() {
        let registry = SchemaRegistry::new();
        let schema = Schema::builder("Ordered")
            .field(Field::string("first"))
            .field(Field::integer("second"))
            .field(Field::boolean("third"))
            .build(&registry)
            .unwrap();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["first", "second", "third", "id"]);
    }

    #[test]
    fn test_implicit_identity_is_synthesized() {
        let registry = SchemaRegistry::new();
        let schema = Schema::builder("Thing")
            .field(Field::string("label"))
            .build(&registry)
            .unwrap();
        assert!(schema.has_implicit_id());
        let pk = schema.identity_field().unwrap();
        assert_eq!(pk.wire_name(), ID_WIRE_NAME);
    }

    #[test]
    fn test_explicit_identity_suppresses_implicit() {
        let registry = SchemaRegistry::new();
        let schema = Schema::builder("Slugged")
            .field(Field::string("slug").primary_key())
            .build(&registry)
            .unwrap();
        assert!(!schema.has_implicit_id());
        assert_eq!(schema.identity_field().unwrap().name(), "slug");
        assert!(schema.field("id").is_none());
    }

    #[test]
    fn test_inheritance_merges_in_creation_order() {
        let registry = SchemaRegistry::new();
        let base = Schema::builder("Content")
            .field(Field::string("title"))
            .field(Field::datetime("created"))
            .build(&registry)
            .unwrap();
        let child = Schema::builder("Article")
            .extend(&base)
            .field(Field::string("body"))
            .build(&registry)
            .unwrap();
        let names: Vec<&str> = child.fields().iter().map(|f| f.name()).collect();
        // Parent fields (including its identity) come before the child's.
        assert_eq!(names, vec!["title", "created", "id", "body"]);
        assert_eq!(child.collection(), base.collection());
    }

    #[test]
    fn test_redeclared_attribute_replaces_inherited() {
        let registry = SchemaRegistry::new();
        let base = Schema::builder("Base")
            .field(Field::string("status"))
            .build(&registry)
            .unwrap();
        let child = Schema::builder("Child")
            .extend(&base)
            .field(
                Field::string("status").choices(vec![Value::String("on".into())]),
            )
            .build(&registry)
            .unwrap();
        let statuses: Vec<&Arc<Field>> = child
            .fields()
            .iter()
            .filter(|f| f.name() == "status")
            .collect();
        assert_eq!(statuses.len(), 1);
        // The replacement keeps its own (later) position.
        let names: Vec<&str> = child.fields().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["id", "status"]);
    }

    #[test]
    fn test_wire_name_collision_is_rejected() {
        let registry = SchemaRegistry::new();
        let result = Schema::builder("Colliding")
            .field(Field::string("a").store_as("x"))
            .field(Field::string("b").store_as("x"))
            .build(&registry);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn test_redeclared_attribute_cannot_take_a_sibling_wire_name() {
        let registry = SchemaRegistry::new();
        let base = Schema::builder("Base2")
            .field(Field::string("a"))
            .field(Field::string("b").store_as("x"))
            .build(&registry)
            .unwrap();
        let result = Schema::builder("Child2")
            .extend(&base)
            .field(Field::string("a").store_as("x"))
            .build(&registry);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn test_final_schema_cannot_be_extended() {
        let registry = SchemaRegistry::new();
        let sealed = Schema::builder("Sealed")
            .field(Field::string("x"))
            .final_()
            .build(&registry)
            .unwrap();
        assert!(!sealed.writes_type_tag());
        let result = Schema::builder("Breaker").extend(&sealed).build(&registry);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn test_subtypes_propagate_to_all_ancestors() {
        let registry = SchemaRegistry::new();
        let a = Schema::builder("A").field(Field::string("x")).build(&registry).unwrap();
        let b = Schema::builder("B").extend(&a).build(&registry).unwrap();
        let c = Schema::builder("C").extend(&b).build(&registry).unwrap();
        assert_eq!(a.subtype_names(), vec!["B".to_string(), "C".to_string()]);
        assert_eq!(b.subtype_names(), vec!["C".to_string()]);
        assert!(c.subtype_names().is_empty());
        assert!(a.accepts_instance(&c));
        assert!(!c.accepts_instance(&a));
        assert_eq!(a.instance_names(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_delete_rule_registers_on_target() {
        let registry = SchemaRegistry::new();
        let user = Schema::builder("User")
            .field(Field::string("name"))
            .build(&registry)
            .unwrap();
        Schema::builder("Session")
            .field(Field::reference("user", "User").on_delete(DeleteRule::Cascade))
            .build(&registry)
            .unwrap();
        let rules = user.delete_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dependent, "Session");
        assert_eq!(rules[0].field, "user");
        assert_eq!(rules[0].rule, DeleteRule::Cascade);
    }

    #[test]
    fn test_delete_rule_on_unregistered_target_is_rejected() {
        let registry = SchemaRegistry::new();
        let result = Schema::builder("Orphan")
            .field(Field::reference("ghost", "Nowhere").on_delete(DeleteRule::Nullify))
            .build(&registry);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn test_embedded_schema_has_no_identity() {
        let registry = SchemaRegistry::new();
        let schema = Schema::builder("Point")
            .embedded()
            .field(Field::float("x"))
            .field(Field::float("y"))
            .build(&registry)
            .unwrap();
        assert!(schema.identity_field().is_none());
        assert!(schema.is_embedded());
    }
}
