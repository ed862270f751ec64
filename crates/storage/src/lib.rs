pub mod db;
pub mod reconcile;
pub mod upsert;

pub use db::{
    create_db, create_memory_db, ensure_entity_tables, merged_table_name, physical_columns,
    table_name, DbPool,
};
pub use reconcile::{
    MergeLabel, MergedRow, MergedView, ReconcileError, ReconciliationViewBuilder, ViewStats,
};
pub use upsert::{StoreError, UpsertWriter, WriteCounts};
