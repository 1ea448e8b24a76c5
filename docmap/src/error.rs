use thiserror::Error;

use crate::validation::ErrorTree;

#[derive(Error, Debug)]
pub enum Error {
    /// A schema was composed incorrectly (conflicting wire names, extending a
    /// final schema, a delete rule on a by-name reference, ...). Fatal at
    /// definition time.
    #[error("Definition error: {0}")]
    Definition(String),

    /// Field-keyed, aggregated validation failure.
    #[error("Validation error: {0}")]
    Validation(ErrorTree),

    /// A single-result query matched no document.
    #[error("No {schema} document found in '{collection}' matching the query")]
    NotFound { schema: String, collection: String },

    /// A single-result query matched more than one document.
    #[error("Multiple {schema} documents found in '{collection}' matching the query")]
    MultipleFound { schema: String, collection: String },

    /// An operation could not be performed (DENY rule blocked a delete,
    /// refresh before save, ...).
    #[error("Operation error: {0}")]
    Operation(String),

    /// An optional capability was used without its prerequisite being
    /// available. Environment-dependent, unlike `Definition`.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Propagated failure from the storage collaborator.
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand used by the validation pipeline for a single-field failure.
    pub(crate) fn validation_message(field: &str, message: impl Into<String>) -> Error {
        let mut tree = ErrorTree::new();
        tree.push_message(field, message.into());
        Error::Validation(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_carries_schema_and_collection() {
        let err = Error::NotFound {
            schema: "blog.Post".into(),
            collection: "post".into(),
        };
        // Callers can branch on the variant across schemas, or on the
        // schema name for one schema.
        match err {
            Error::NotFound { ref schema, .. } => assert_eq!(schema, "blog.Post"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_validation_message_builds_single_entry_tree() {
        let err = Error::validation_message("title", "field is required.");
        match err {
            Error::Validation(tree) => {
                assert_eq!(tree.messages_for("title"), vec!["field is required."]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
