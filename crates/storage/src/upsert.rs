use std::collections::BTreeMap;

use booksync_core::{parse_timestamp, CanonicalRow, DataSource, EntitySchema, ScalarValue};
use serde::Serialize;
use thiserror::Error;

use crate::db::{bind_value, table_name, DbPool};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{entity} row from {data_source} has no value for key column '{key}'")]
    RowWithoutKey {
        entity: String,
        data_source: DataSource,
        key: String,
    },
}

/// Per-batch write outcome, counted per business key: a document entity
/// whose line items expand to several physical rows still counts once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl WriteCounts {
    pub fn merge(&mut self, other: WriteCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Idempotent insert-or-replace keyed by the entity's business key.
///
/// Each batch runs in one transaction; any row-level failure rolls the
/// whole batch back so the orchestrator can retry the window without a
/// half-written state. An incoming record only replaces a stored one
/// when it is the same age or newer, so a stale re-fetch can never
/// clobber fresher local data.
pub struct UpsertWriter<'a> {
    pool: &'a DbPool,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    pub async fn write(
        &self,
        schema: &EntitySchema,
        source: DataSource,
        rows: &[CanonicalRow],
    ) -> Result<WriteCounts, StoreError> {
        let mut counts = WriteCounts::default();
        if rows.is_empty() {
            return Ok(counts);
        }

        let table = table_name(source, schema.name());
        let key_column = schema.business_key(source);
        let freshness_column = schema.freshness_field(source);

        // Group the batch by business key, preserving first-seen order.
        // Line-item expansion hands us several rows per key; they are
        // replaced as a unit.
        let mut groups: BTreeMap<String, Vec<&CanonicalRow>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            let key = row.key_value(key_column).ok_or_else(|| StoreError::RowWithoutKey {
                entity: schema.name().to_string(),
                data_source: source,
                key: key_column.to_string(),
            })?;
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }

        let column_names = schema.column_names(source);
        let insert_sql = insert_statement(&table, &column_names);

        let mut tx = self.pool.begin().await?;

        for key in &order {
            let group = &groups[key];

            let stored_freshness: Option<Option<String>> = match freshness_column {
                Some(col) => sqlx::query_scalar(&format!(
                    "SELECT {col} FROM {table} WHERE {key_column} = ? LIMIT 1"
                ))
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?,
                None => sqlx::query_scalar(&format!(
                    "SELECT NULL FROM {table} WHERE {key_column} = ? LIMIT 1"
                ))
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?,
            };

            match stored_freshness {
                None => {
                    for row in group {
                        insert_row(&mut tx, &insert_sql, &column_names, row).await?;
                    }
                    counts.inserted += 1;
                }
                Some(stored) => {
                    if incoming_is_stale(
                        freshness_column,
                        group[0],
                        stored.as_deref(),
                    ) {
                        tracing::debug!(
                            entity = schema.name(),
                            %source,
                            key,
                            "incoming row older than stored, skipping"
                        );
                        counts.skipped += 1;
                        continue;
                    }
                    sqlx::query(&format!("DELETE FROM {table} WHERE {key_column} = ?"))
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                    for row in group {
                        insert_row(&mut tx, &insert_sql, &column_names, row).await?;
                    }
                    counts.updated += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(counts)
    }
}

fn insert_statement(table: &str, column_names: &[&str]) -> String {
    let mut columns: Vec<&str> = column_names.to_vec();
    columns.push("data_source");
    columns.push("synced_at");
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sql: &str,
    column_names: &[&str],
    row: &CanonicalRow,
) -> Result<(), sqlx::Error> {
    let mut query = sqlx::query(sql);
    for name in column_names {
        query = bind_value(query, row.get(name));
    }
    query = query.bind(row.data_source.as_str());
    query = query.bind(row.synced_at.format("%Y-%m-%dT%H:%M:%SZ").to_string());
    query.execute(&mut **tx).await?;
    Ok(())
}

/// True when the incoming record is strictly older than the stored one.
/// Records without a comparable timestamp on either side replace the
/// stored row, which keeps the writer idempotent for timestamp-free
/// entities.
fn incoming_is_stale(
    freshness_column: Option<&str>,
    incoming: &CanonicalRow,
    stored: Option<&str>,
) -> bool {
    let Some(column) = freshness_column else {
        return false;
    };
    let incoming_ts = match incoming.get(column) {
        ScalarValue::Text(s) => parse_timestamp(s),
        _ => None,
    };
    let stored_ts = stored.and_then(parse_timestamp);
    match (incoming_ts, stored_ts) {
        (Some(incoming), Some(stored)) => incoming < stored,
        _ => false,
    }
}
