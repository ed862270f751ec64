use std::path::Path;

use booksync_core::{ColumnType, DataSource, EntitySchema, EntitySchemaRegistry, ScalarValue};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    connect(&format!("sqlite:{}?mode=rwc", path.display())).await
}

/// In-memory database for tests. The pool is capped at one connection,
/// so the database lives as long as the pool.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    connect("sqlite::memory:").await
}

async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Physical table name for one side of an entity: `csv_invoice`,
/// `json_sales_order`, and so on.
pub fn table_name(source: DataSource, entity: &str) -> String {
    format!("{}_{}", source.as_str(), entity)
}

pub fn merged_table_name(entity: &str) -> String {
    format!("merged_{entity}")
}

/// Creates the per-source tables for every registered entity, and adds
/// any declared column missing from an existing table. Purely additive:
/// columns are never dropped or retyped.
pub async fn ensure_entity_tables(
    pool: &DbPool,
    registry: &EntitySchemaRegistry,
) -> Result<(), sqlx::Error> {
    for schema in registry.entities() {
        for source in [DataSource::Csv, DataSource::Json] {
            ensure_table(pool, schema, source).await?;
        }
    }
    Ok(())
}

async fn ensure_table(
    pool: &DbPool,
    schema: &EntitySchema,
    source: DataSource,
) -> Result<(), sqlx::Error> {
    let table = table_name(source, schema.name());

    let mut columns: Vec<String> = schema
        .columns(source)
        .map(|c| format!("{} {}", c.name, c.ty.sql_type()))
        .collect();
    columns.push("data_source TEXT NOT NULL".to_string());
    columns.push("synced_at TEXT NOT NULL".to_string());

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        columns.join(", ")
    ))
    .execute(pool)
    .await?;

    // Align an existing table with the registry by appending whatever
    // is missing.
    let existing = physical_columns(pool, &table).await?;
    for column in schema.columns(source) {
        if !existing.iter().any(|c| c == column.name) {
            sqlx::query(&format!(
                "ALTER TABLE {table} ADD COLUMN {} {}",
                column.name,
                column.ty.sql_type()
            ))
            .execute(pool)
            .await?;
        }
    }

    let key = schema.business_key(source);
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table}({key})"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Column names of a physical table; empty when the table does not
/// exist.
pub async fn physical_columns(pool: &DbPool, table: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    rows.iter().map(|row| row.try_get("name")).collect()
}

/// Binds a typed value onto a query. Decimals and dates travel as their
/// canonical strings so nothing round-trips through floating point.
pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q ScalarValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        ScalarValue::Null => query.bind(None::<String>),
        ScalarValue::Text(s) => query.bind(s.as_str()),
        ScalarValue::Integer(n) => query.bind(*n),
        ScalarValue::Decimal(d) => query.bind(d.to_string()),
        ScalarValue::Boolean(b) => query.bind(*b),
    }
}

/// Decodes one column of a fetched row back into a typed value, using
/// the declared column type rather than runtime introspection.
pub(crate) fn read_value(
    row: &SqliteRow,
    name: &str,
    ty: ColumnType,
) -> Result<ScalarValue, sqlx::Error> {
    let value = match ty {
        ColumnType::Integer => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(ScalarValue::Null, ScalarValue::Integer),
        ColumnType::Boolean => row
            .try_get::<Option<bool>, _>(name)?
            .map_or(ScalarValue::Null, ScalarValue::Boolean),
        ColumnType::Decimal => match row.try_get::<Option<String>, _>(name)? {
            None => ScalarValue::Null,
            Some(s) => s
                .parse::<Decimal>()
                .map(ScalarValue::Decimal)
                .unwrap_or(ScalarValue::Text(s)),
        },
        ColumnType::Text | ColumnType::Date => row
            .try_get::<Option<String>, _>(name)?
            .map_or(ScalarValue::Null, ScalarValue::Text),
    };
    Ok(value)
}
