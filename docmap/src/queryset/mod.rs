//! Immutable query cursors. Every refinement clones the cursor, so a base
//! query can be shared and specialized freely.

use std::sync::Arc;

use log::debug;

use crate::db::Database;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::fields::DeleteRule;
use crate::schema::{DeleteRuleEntry, Schema, ID_WIRE_NAME, TYPE_TAG};
use crate::storage::{Filter, FindOptions, Order, Projection, UpdateOp};
use crate::value::{Record, Value};

#[derive(Clone)]
pub struct QuerySet {
    db: Database,
    schema: Arc<Schema>,
    filter: Filter,
    sort: Vec<(String, Order)>,
    skip: u64,
    limit: Option<u64>,
    projection: Projection,
    /// `None`: return references as identities. `Some`: dereference the
    /// named paths after fetching (empty list means every reference).
    related: Option<Vec<String>>,
}

impl QuerySet {
    pub(crate) fn new(db: Database, schema: Arc<Schema>) -> QuerySet {
        QuerySet {
            db,
            schema,
            filter: Filter::All,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            projection: Projection::All,
            related: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    // ── Refinements ──────────────────────────────────────────────────

    /// Conjoin a raw filter (wire names) with the current one.
    pub fn filter(&self, filter: Filter) -> QuerySet {
        let mut next = self.clone();
        next.filter = next.filter.and(filter);
        next
    }

    /// Filter on an attribute, converting the value to wire form through the
    /// field descriptor.
    pub fn where_eq(&self, attr: &str, value: Value) -> Result<QuerySet> {
        let field = self.schema.field(attr).ok_or_else(|| {
            Error::Operation(format!(
                "'{}' has no field named '{attr}'",
                self.schema.name()
            ))
        })?;
        let wire_value = field
            .to_wire(&value, self.db.registry())
            .map_err(|msg| Error::validation_message(attr, msg))?;
        Ok(self.filter(Filter::eq(field.wire_name(), wire_value)))
    }

    /// Sort on a field; attribute names resolve to their wire names, other
    /// names pass through as-is.
    pub fn order_by(&self, field: &str, order: Order) -> QuerySet {
        let mut next = self.clone();
        let wire = self
            .schema
            .field(field)
            .map(|f| f.wire_name().to_string())
            .unwrap_or_else(|| field.to_string());
        next.sort.push((wire, order));
        next
    }

    pub fn skip(&self, n: u64) -> QuerySet {
        let mut next = self.clone();
        next.skip = n;
        next
    }

    pub fn limit(&self, n: u64) -> QuerySet {
        let mut next = self.clone();
        next.limit = Some(n);
        next
    }

    /// Fetch only the named attributes (identity and type tag always come
    /// along).
    pub fn only(&self, attrs: &[&str]) -> QuerySet {
        let mut next = self.clone();
        next.projection = Projection::Include(self.wire_names(attrs));
        next
    }

    pub fn exclude(&self, attrs: &[&str]) -> QuerySet {
        let mut next = self.clone();
        next.projection = Projection::Exclude(self.wire_names(attrs));
        next
    }

    /// Dereference the given paths after fetching; an empty list follows
    /// every reference field.
    pub fn select_related(&self, paths: &[&str]) -> QuerySet {
        let mut next = self.clone();
        next.related = Some(paths.iter().map(|p| p.to_string()).collect());
        next
    }

    fn wire_names(&self, attrs: &[&str]) -> Vec<String> {
        attrs
            .iter()
            .map(|attr| {
                self.schema
                    .field(attr)
                    .map(|f| f.wire_name().to_string())
                    .unwrap_or_else(|| attr.to_string())
            })
            .collect()
    }

    // ── Execution ────────────────────────────────────────────────────

    /// The effective filter: the caller's terms plus the type-tag constraint
    /// that scopes this cursor to its schema family within a shared
    /// collection. Final schemas store no tag and get no constraint.
    pub fn effective_filter(&self) -> Filter {
        let mut filter = self.filter.clone();
        if self.schema.writes_type_tag() {
            let names = self.schema.instance_names();
            let tag_filter = if names.len() == 1 {
                Filter::eq(TYPE_TAG, Value::String(names[0].clone()))
            } else {
                Filter::is_in(
                    TYPE_TAG,
                    names.into_iter().map(Value::String).collect(),
                )
            };
            filter = tag_filter.and(filter);
        }
        filter
    }

    fn find_options(&self) -> FindOptions {
        FindOptions {
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            projection: self.projection.clone(),
        }
    }

    /// Raw mode: fetch matching records without materializing documents.
    pub fn fetch_records(&self) -> Result<Vec<Record>> {
        self.db.storage().find(
            self.schema.collection(),
            &self.effective_filter(),
            &self.find_options(),
        )
    }

    /// Fetch matching records and materialize each as a document. Records
    /// tagged with a subtype come back as that subtype.
    pub fn fetch(&self) -> Result<Vec<Document>> {
        let records = self.fetch_records()?;
        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            docs.push(Document::from_record(
                self.schema.clone(),
                self.db.registry().clone(),
                record,
            )?);
        }
        if let Some(paths) = &self.related {
            let paths = if paths.is_empty() { None } else { Some(paths.as_slice()) };
            crate::dereference::dereference_documents(&self.db, &mut docs, paths)?;
        }
        Ok(docs)
    }

    pub fn first(&self) -> Result<Option<Document>> {
        Ok(self.limit(1).fetch()?.into_iter().next())
    }

    /// Exactly-one fetch. Zero matches and multiple matches fail with
    /// distinguishable errors.
    pub fn get(&self, filter: Filter) -> Result<Document> {
        let narrowed = self.filter(filter);
        let mut docs = narrowed.limit(2).fetch()?;
        match docs.len() {
            1 => Ok(docs.remove(0)),
            0 => Err(Error::NotFound {
                schema: self.schema.name().to_string(),
                collection: self.schema.collection().to_string(),
            }),
            _ => Err(Error::MultipleFound {
                schema: self.schema.name().to_string(),
                collection: self.schema.collection().to_string(),
            }),
        }
    }

    pub fn get_by_id(&self, id: Value) -> Result<Document> {
        self.get(Filter::eq(ID_WIRE_NAME, id))
    }

    /// Matching count, respecting the cursor's skip/limit window.
    pub fn count(&self) -> Result<u64> {
        let matched = self
            .db
            .storage()
            .count(self.schema.collection(), &self.effective_filter())?;
        let windowed = matched.saturating_sub(self.skip);
        Ok(match self.limit {
            Some(limit) => windowed.min(limit),
            None => windowed,
        })
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    /// Apply update ops (wire names) to every matching record. Returns the
    /// match count.
    pub fn update(&self, ops: &[UpdateOp]) -> Result<u64> {
        self.db
            .storage()
            .update_many(self.schema.collection(), &self.effective_filter(), ops)
    }

    /// Delete every matching document, honoring the delete rules dependents
    /// registered against this schema.
    ///
    /// DENY rules are all checked before anything is removed, so a denied
    /// delete leaves the database untouched. The primary documents are
    /// removed before any CASCADE recursion, so mutually-cascading schemas
    /// terminate: the second leg of a cycle finds nothing left to delete.
    pub fn delete(&self) -> Result<u64> {
        let rules = self.schema.delete_rules();
        if rules.is_empty() {
            return self
                .db
                .storage()
                .delete_many(self.schema.collection(), &self.effective_filter());
        }

        // Snapshot the victim identities with a projection-only find.
        let options = FindOptions {
            projection: Projection::Include(Vec::new()),
            ..FindOptions::default()
        };
        let ids: Vec<Value> = self
            .db
            .storage()
            .find(self.schema.collection(), &self.effective_filter(), &options)?
            .into_iter()
            .filter_map(|mut r| r.remove(ID_WIRE_NAME))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        for rule in rules.iter().filter(|r| r.rule == DeleteRule::Deny) {
            let (collection, wire, _) = self.resolve_dependent(rule)?;
            let blocking = self
                .db
                .storage()
                .count(&collection, &Filter::is_in(&wire, ids.clone()))?;
            if blocking > 0 {
                return Err(Error::Operation(format!(
                    "cannot delete {}: {blocking} {} document(s) still reference it",
                    self.schema.name(),
                    rule.dependent
                )));
            }
        }

        debug!(
            "delete {} {} document(s), {} dependent rule(s)",
            ids.len(),
            self.schema.name(),
            rules.len()
        );
        let removed = self.db.storage().delete_many(
            self.schema.collection(),
            &Filter::is_in(ID_WIRE_NAME, ids.clone()),
        )?;

        for rule in &rules {
            match rule.rule {
                DeleteRule::DoNothing | DeleteRule::Deny => {}
                DeleteRule::Nullify => {
                    let (collection, wire, _) = self.resolve_dependent(rule)?;
                    self.db.storage().update_many(
                        &collection,
                        &Filter::is_in(&wire, ids.clone()),
                        &[UpdateOp::Unset(wire.clone())],
                    )?;
                }
                DeleteRule::Pull => {
                    let (collection, wire, _) = self.resolve_dependent(rule)?;
                    let pulls: Vec<UpdateOp> = ids
                        .iter()
                        .map(|id| UpdateOp::Pull(wire.clone(), id.clone()))
                        .collect();
                    self.db.storage().update_many(
                        &collection,
                        &Filter::is_in(&wire, ids.clone()),
                        &pulls,
                    )?;
                }
                DeleteRule::Cascade => {
                    let (_, wire, dependent) = self.resolve_dependent(rule)?;
                    QuerySet::new(self.db.clone(), dependent)
                        .filter(Filter::is_in(&wire, ids.clone()))
                        .delete()?;
                }
            }
        }
        Ok(removed)
    }

    /// Rule entries carry the dependent's attribute name; storage needs the
    /// collection and wire name.
    fn resolve_dependent(
        &self,
        rule: &DeleteRuleEntry,
    ) -> Result<(String, String, Arc<Schema>)> {
        let dependent = self.db.registry().get(&rule.dependent)?;
        let field = dependent.field(&rule.field).ok_or_else(|| {
            Error::Definition(format!(
                "'{}' registered a delete rule for unknown field '{}'",
                rule.dependent, rule.field
            ))
        })?;
        Ok((
            dependent.collection().to_string(),
            field.wire_name().to_string(),
            dependent.clone(),
        ))
    }
}

impl std::fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("schema", &self.schema.name())
            .field("filter", &self.filter)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Field;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    fn database() -> Database {
        Database::new(Arc::new(MemoryStorage::new()))
    }

    fn post_schema(db: &Database) -> Arc<Schema> {
        Schema::builder("Post")
            .field(Field::string("title").required())
            .field(Field::integer("rating").default_value(Value::Int(0)))
            .build(db.registry())
            .unwrap()
    }

    fn save_post(db: &Database, schema: &Arc<Schema>, title: &str, rating: i64) -> Document {
        let mut doc = Document::new(schema, db.registry());
        doc.set("title", Value::String(title.into())).unwrap();
        doc.set("rating", Value::Int(rating)).unwrap();
        db.collection(schema).unwrap().save(&mut doc).unwrap();
        doc
    }

    #[test]
    fn test_refinements_leave_the_base_cursor_unchanged() {
        let db = database();
        let schema = post_schema(&db);
        save_post(&db, &schema, "a", 1);
        save_post(&db, &schema, "b", 2);
        save_post(&db, &schema, "c", 3);

        let base = db.query(&schema);
        let top = base.where_eq("rating", Value::Int(3)).unwrap();
        let one = base.limit(1);
        assert_eq!(top.count().unwrap(), 1);
        assert_eq!(one.count().unwrap(), 1);
        // The shared base still sees everything.
        assert_eq!(base.count().unwrap(), 3);
    }

    #[test]
    fn test_type_tag_filter_spans_subtypes() {
        let db = database();
        let schema = post_schema(&db);
        let featured = Schema::builder("FeaturedPost")
            .extend(&schema)
            .field(Field::string("banner"))
            .build(db.registry())
            .unwrap();
        save_post(&db, &schema, "plain", 0);
        let mut special = Document::new(&featured, db.registry());
        special.set("title", Value::String("shiny".into())).unwrap();
        special.set("banner", Value::String("gold".into())).unwrap();
        db.collection(&featured).unwrap().save(&mut special).unwrap();

        // Both land in the same collection; the parent cursor sees both and
        // materializes the subtype as itself.
        let all = db.query(&schema).order_by("title", Order::Asc).fetch().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].schema().name(), "Post");
        assert_eq!(all[1].schema().name(), "FeaturedPost");

        let only_featured = db.query(&featured).fetch().unwrap();
        assert_eq!(only_featured.len(), 1);
        assert_eq!(only_featured[0].schema().name(), "FeaturedPost");
    }

    #[test]
    fn test_get_distinguishes_missing_from_ambiguous() {
        let db = database();
        let schema = post_schema(&db);
        save_post(&db, &schema, "same", 1);
        save_post(&db, &schema, "same", 2);

        let qs = db.query(&schema);
        let missing = qs.get(Filter::eq("title", Value::String("nope".into())));
        assert!(matches!(missing, Err(Error::NotFound { .. })));
        let ambiguous = qs.get(Filter::eq("title", Value::String("same".into())));
        assert!(matches!(ambiguous, Err(Error::MultipleFound { .. })));
        let one = qs
            .get(Filter::eq("rating", Value::Int(2)))
            .unwrap();
        assert_eq!(one.value("title").unwrap(), Value::String("same".into()));
    }

    #[test]
    fn test_count_respects_skip_and_limit() {
        let db = database();
        let schema = post_schema(&db);
        for n in 0..5 {
            save_post(&db, &schema, "p", n);
        }
        let qs = db.query(&schema);
        assert_eq!(qs.count().unwrap(), 5);
        assert_eq!(qs.skip(2).count().unwrap(), 3);
        assert_eq!(qs.skip(2).limit(2).count().unwrap(), 2);
        assert_eq!(qs.skip(9).count().unwrap(), 0);
    }

    #[test]
    fn test_only_keeps_identity() {
        let db = database();
        let schema = post_schema(&db);
        save_post(&db, &schema, "a", 7);
        let docs = db.query(&schema).only(&["rating"]).fetch().unwrap();
        assert_eq!(docs[0].value("rating").unwrap(), Value::Int(7));
        assert!(!docs[0].is_set("title"));
        assert!(docs[0].identity().unwrap().is_some());
    }

    #[test]
    fn test_update_touches_matching_records() {
        let db = database();
        let schema = post_schema(&db);
        save_post(&db, &schema, "a", 1);
        save_post(&db, &schema, "b", 1);
        save_post(&db, &schema, "c", 2);
        let touched = db
            .query(&schema)
            .filter(Filter::eq("rating", Value::Int(1)))
            .update(&[UpdateOp::Set("rating".into(), Value::Int(9))])
            .unwrap();
        assert_eq!(touched, 2);
        assert_eq!(
            db.query(&schema)
                .filter(Filter::eq("rating", Value::Int(9)))
                .count()
                .unwrap(),
            2
        );
    }

    // ── Delete rules ─────────────────────────────────────────────────

    fn user_schema(db: &Database) -> Arc<Schema> {
        Schema::builder("User")
            .field(Field::string("name").required())
            .build(db.registry())
            .unwrap()
    }

    fn save_user(db: &Database, schema: &Arc<Schema>, name: &str) -> Document {
        let mut doc = Document::new(schema, db.registry());
        doc.set("name", Value::String(name.into())).unwrap();
        db.collection(schema).unwrap().save(&mut doc).unwrap();
        doc
    }

    #[test]
    fn test_deny_blocks_the_whole_delete() {
        let db = database();
        let user = user_schema(&db);
        let session = Schema::builder("Session")
            .field(Field::reference("user", &user).on_delete(DeleteRule::Deny))
            .build(db.registry())
            .unwrap();
        let alice = save_user(&db, &user, "alice");
        save_user(&db, &user, "bob");
        let mut held = Document::new(&session, db.registry());
        held.set("user", Value::Document(alice)).unwrap();
        db.collection(&session).unwrap().save(&mut held).unwrap();

        // bob is deletable on his own, but a delete covering alice is denied
        // before anything is removed.
        let result = db.query(&user).delete();
        assert!(matches!(result, Err(Error::Operation(_))));
        assert_eq!(db.query(&user).count().unwrap(), 2);
    }

    #[test]
    fn test_nullify_unsets_the_referencing_field() {
        let db = database();
        let user = user_schema(&db);
        let session = Schema::builder("Session")
            .field(Field::reference("user", &user).on_delete(DeleteRule::Nullify))
            .field(Field::string("token"))
            .build(db.registry())
            .unwrap();
        let alice = save_user(&db, &user, "alice");
        let mut held = Document::new(&session, db.registry());
        held.set("user", Value::Document(alice)).unwrap();
        held.set("token", Value::String("t1".into())).unwrap();
        db.collection(&session).unwrap().save(&mut held).unwrap();

        assert_eq!(db.query(&user).delete().unwrap(), 1);
        let sessions = db.query(&session).fetch().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_set("user"));
        assert_eq!(sessions[0].value("token").unwrap(), Value::String("t1".into()));
    }

    #[test]
    fn test_cascade_removes_dependents_transitively() {
        let db = database();
        let user = user_schema(&db);
        let session = Schema::builder("Session")
            .field(Field::reference("user", &user).on_delete(DeleteRule::Cascade))
            .build(db.registry())
            .unwrap();
        let audit = Schema::builder("Audit")
            .field(Field::reference("session", &session).on_delete(DeleteRule::Cascade))
            .build(db.registry())
            .unwrap();

        let alice = save_user(&db, &user, "alice");
        let mut held = Document::new(&session, db.registry());
        held.set("user", Value::Document(alice)).unwrap();
        db.collection(&session).unwrap().save(&mut held).unwrap();
        let mut entry = Document::new(&audit, db.registry());
        entry.set("session", Value::Document(held)).unwrap();
        db.collection(&audit).unwrap().save(&mut entry).unwrap();

        assert_eq!(db.query(&user).delete().unwrap(), 1);
        assert_eq!(db.query(&session).count().unwrap(), 0);
        assert_eq!(db.query(&audit).count().unwrap(), 0);
    }

    #[test]
    fn test_cyclic_cascade_terminates() {
        let db = database();
        // Self-referencing cascade: deleting a node removes every node that
        // points at it, and the recursion bottoms out because the primary
        // records are removed before the recursion starts.
        let node = Schema::builder("Node")
            .field(Field::string("label"))
            .field(Field::reference("peer", "Node").on_delete(DeleteRule::Cascade))
            .build(db.registry())
            .unwrap();
        let nodes = db.collection(&node).unwrap();

        let mut a = Document::new(&node, db.registry());
        a.set("label", Value::String("a".into())).unwrap();
        nodes.save(&mut a).unwrap();
        let mut b = Document::new(&node, db.registry());
        b.set("label", Value::String("b".into())).unwrap();
        b.set("peer", Value::Document(a.clone())).unwrap();
        nodes.save(&mut b).unwrap();
        // Close the cycle: a -> b -> a.
        a.set("peer", Value::Document(b.clone())).unwrap();
        nodes.save(&mut a).unwrap();

        let removed = db
            .query(&node)
            .filter(Filter::eq("label", Value::String("a".into())))
            .delete()
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.query(&node).count().unwrap(), 0);
    }

    #[test]
    fn test_pull_removes_ids_from_list_references() {
        let db = database();
        let tag = Schema::builder("Tag")
            .field(Field::string("label"))
            .build(db.registry())
            .unwrap();
        let post = Schema::builder("TaggedPost")
            .field(Field::string("title"))
            .field(Field::list(
                "tags",
                Some(Field::reference("tags", &tag).on_delete(DeleteRule::Pull)),
            ))
            .build(db.registry())
            .unwrap();

        let mut t1 = Document::new(&tag, db.registry());
        t1.set("label", Value::String("rust".into())).unwrap();
        db.collection(&tag).unwrap().save(&mut t1).unwrap();
        let mut t2 = Document::new(&tag, db.registry());
        t2.set("label", Value::String("odm".into())).unwrap();
        db.collection(&tag).unwrap().save(&mut t2).unwrap();

        let mut p = Document::new(&post, db.registry());
        p.set("title", Value::String("hello".into())).unwrap();
        p.set(
            "tags",
            Value::Array(vec![Value::Document(t1.clone()), Value::Document(t2)]),
        )
        .unwrap();
        db.collection(&post).unwrap().save(&mut p).unwrap();

        let removed = db
            .query(&tag)
            .filter(Filter::eq("label", Value::String("rust".into())))
            .delete()
            .unwrap();
        assert_eq!(removed, 1);
        let posts = db.query(&post).fetch().unwrap();
        let tags = posts[0].value("tags").unwrap();
        assert_eq!(tags.as_array().unwrap().len(), 1);
    }
}
