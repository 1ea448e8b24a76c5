//! Schema registry: name-based lookup for forward references.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::fields::DeleteRule;
use crate::schema::{DeleteRuleEntry, Schema};

/// All schemas known to one database, keyed by name. Injected everywhere a
/// forward reference might need resolving; never a process-wide global, so
/// two registries can hold schemas with the same name independently.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> SchemaRegistry {
        SchemaRegistry::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Schema>>> {
        self.schemas.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Schema>>> {
        self.schemas.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, schema: Arc<Schema>) -> Result<()> {
        let mut schemas = self.write();
        if schemas.contains_key(schema.name()) {
            return Err(Error::Definition(format!(
                "a schema named '{}' is already registered",
                schema.name()
            )));
        }
        schemas.insert(schema.name().to_string(), schema);
        Ok(())
    }

    /// Look up a schema. Exact match first, then dotted-suffix match, so a
    /// schema registered as `blog.Post` resolves from the short name `Post`
    /// as long as the short name is unambiguous.
    pub fn get(&self, name: &str) -> Result<Arc<Schema>> {
        let schemas = self.read();
        if let Some(schema) = schemas.get(name) {
            return Ok(schema.clone());
        }
        let suffix = format!(".{name}");
        let mut matches = schemas
            .values()
            .filter(|s| s.name().ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some(schema), None) => Ok(schema.clone()),
            (Some(_), Some(_)) => Err(Error::Definition(format!(
                "the schema name '{name}' is ambiguous; use the full dotted name"
            ))),
            _ => Err(Error::Definition(format!("no schema named '{name}'"))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record that `dependent.field` references `target`, so deletes against
    /// `target` know which dependents to inspect.
    pub(crate) fn register_delete_rule(
        &self,
        target: &str,
        dependent: &str,
        field: &str,
        rule: DeleteRule,
    ) -> Result<()> {
        let target = self.get(target)?;
        target.add_delete_rule(DeleteRuleEntry {
            dependent: dependent.to_string(),
            field: field.to_string(),
            rule,
        });
        Ok(())
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.names())
            .finish()
    }
}
