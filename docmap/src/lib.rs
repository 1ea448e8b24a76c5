pub mod db;
pub mod dereference;
pub mod document;
pub mod error;
pub mod fields;
pub mod queryset;
pub mod schema;
pub mod storage;
pub mod validation;
pub mod value;

pub use db::{Collection, Database, SaveOptions};
pub use dereference::{dereference, dereference_documents};
pub use document::Document;
pub use error::{Error, Result};
pub use fields::{DeleteRule, Field, FieldKind, TargetRef};
pub use queryset::QuerySet;
pub use schema::{Schema, SchemaRegistry, ID_WIRE_NAME, TYPE_TAG};
pub use storage::{Filter, FindOptions, MemoryStorage, Order, Projection, Storage, UpdateOp};
pub use validation::{ErrorNode, ErrorTree, NON_FIELD_ERRORS};
pub use value::{Record, Value};
