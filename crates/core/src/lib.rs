pub mod config;
pub mod normalize;
pub mod record;
pub mod schema;

pub use config::{ConfigError, MergePrecedence, SyncConfig};
pub use normalize::normalize_column_name;
pub use record::{
    canonicalize_timestamp, parse_timestamp, CanonicalRow, DataSource, RawRecord, ScalarValue,
};
pub use schema::{ColumnDef, ColumnType, EntitySchema, EntitySchemaRegistry};
