use std::collections::{BTreeMap, HashMap};
use std::fmt;

use booksync_core::{
    ColumnDef, DataSource, EntitySchema, MergePrecedence, ScalarValue,
};
use serde::Serialize;
use thiserror::Error;

use crate::db::{
    bind_value, merged_table_name, physical_columns, read_value, table_name, DbPool,
};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    /// The class of defect most likely to recur when a new entity is
    /// added without updating the schema registry, so the message names
    /// the entity and both key columns it tried to join on.
    #[error(
        "reconciliation join key missing for '{entity}': \
         expected csv key '{csv_key}' in {csv_table} and json key '{json_key}' in {json_table}"
    )]
    SchemaMismatch {
        entity: String,
        csv_key: String,
        json_key: String,
        csv_table: String,
        json_table: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeLabel {
    Merged,
    CsvOnly,
    JsonOnly,
}

impl MergeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeLabel::Merged => "merged",
            MergeLabel::CsvOnly => "csv_only",
            MergeLabel::JsonOnly => "json_only",
        }
    }

    fn priority(self) -> i64 {
        match self {
            MergeLabel::Merged => 1,
            MergeLabel::CsvOnly => 2,
            MergeLabel::JsonOnly => 3,
        }
    }
}

impl fmt::Display for MergeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row of the merged view: shared columns resolved by
/// precedence, source-exclusive columns carried through, and the
/// business key hoisted out under a single name regardless of which
/// side supplied it.
#[derive(Debug, Clone, Serialize)]
pub struct MergedRow {
    pub business_key: String,
    pub data_source: MergeLabel,
    pub source_priority: i64,
    pub values: BTreeMap<String, ScalarValue>,
}

impl MergedRow {
    pub fn get(&self, column: &str) -> &ScalarValue {
        self.values.get(column).unwrap_or(&ScalarValue::Null)
    }
}

/// Header-level aggregates reported next to the merged rows, so a
/// legitimate line-item expansion (one header, N lines) is
/// distinguishable from accidental duplication caused by a wrong join
/// key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewStats {
    pub csv_rows: usize,
    pub json_rows: usize,
    pub output_rows: usize,
    pub distinct_business_keys: usize,
    /// Line items per business key, for document entities.
    pub line_items_per_key: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct MergedView {
    pub entity: String,
    pub rows: Vec<MergedRow>,
    pub stats: ViewStats,
}

/// Builds the unified row set for one entity from its two per-source
/// tables. The join keys come from the schema registry: the CSV-side
/// and JSON-side key columns are resolved independently and never
/// assumed to share a name.
pub struct ReconciliationViewBuilder<'a> {
    pool: &'a DbPool,
    precedence: MergePrecedence,
}

impl<'a> ReconciliationViewBuilder<'a> {
    pub fn new(pool: &'a DbPool, precedence: MergePrecedence) -> Self {
        Self { pool, precedence }
    }

    pub async fn build(&self, schema: &EntitySchema) -> Result<MergedView, ReconcileError> {
        let entity = schema.name();
        let csv_table = table_name(DataSource::Csv, entity);
        let json_table = table_name(DataSource::Json, entity);
        let csv_key = schema.business_key(DataSource::Csv);
        let json_key = schema.business_key(DataSource::Json);

        self.check_join_keys(schema, &csv_table, &json_table).await?;

        let csv_rows = self.load_side(schema, DataSource::Csv).await?;
        let json_rows = self.load_side(schema, DataSource::Json).await?;

        // Index JSON rows by business key, preserving row order within
        // a key so line items come out in storage order.
        let mut json_by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, row) in json_rows.iter().enumerate() {
            if let Some(key) = row.get(json_key).and_then(ScalarValue::as_key) {
                json_by_key.entry(key).or_default().push(idx);
            }
        }

        let shared = schema.shared_columns();
        let csv_only = schema.source_only_columns(DataSource::Csv);
        let json_only = schema.source_only_columns(DataSource::Json);

        let mut out = Vec::new();
        let mut matched_keys: Vec<String> = Vec::new();

        // Pass 1: one output row per CSV record, merged with every JSON
        // row sharing its key (line items expand here), or carried
        // through alone.
        for csv_row in &csv_rows {
            let Some(key) = csv_row.get(csv_key).and_then(ScalarValue::as_key) else {
                continue;
            };
            match json_by_key.get(&key) {
                Some(indices) => {
                    for &idx in indices {
                        out.push(self.merge_pair(
                            &key,
                            csv_row,
                            &json_rows[idx],
                            shared,
                            csv_only,
                            json_only,
                        ));
                    }
                    matched_keys.push(key);
                }
                None => {
                    out.push(passthrough(
                        &key,
                        csv_row,
                        MergeLabel::CsvOnly,
                        shared,
                        csv_only,
                        json_only,
                    ));
                }
            }
        }

        // Pass 2: JSON records whose key never appeared on the CSV
        // side. The exclusion is what keeps each business key in
        // exactly one output branch.
        for matched in &matched_keys {
            json_by_key.remove(matched);
        }
        let mut remaining: Vec<(&String, &Vec<usize>)> = json_by_key.iter().collect();
        remaining.sort_by_key(|(_, indices)| indices[0]);
        for (key, indices) in remaining {
            for &idx in indices {
                out.push(passthrough(
                    key,
                    &json_rows[idx],
                    MergeLabel::JsonOnly,
                    shared,
                    csv_only,
                    json_only,
                ));
            }
        }

        let stats = compute_stats(schema, &csv_rows, &json_rows, &out);
        Ok(MergedView {
            entity: entity.to_string(),
            rows: out,
            stats,
        })
    }

    /// Recomputes the merged view and writes it to `merged_<entity>`,
    /// replacing whatever was there. Returns the written view.
    pub async fn materialize(&self, schema: &EntitySchema) -> Result<MergedView, ReconcileError> {
        let view = self.build(schema).await?;
        let table = merged_table_name(schema.name());

        let columns = output_columns(schema);
        let mut ddl: Vec<String> = vec!["business_key TEXT NOT NULL".to_string()];
        ddl.extend(
            columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.ty.sql_type())),
        );
        ddl.push("data_source TEXT NOT NULL".to_string());
        ddl.push("source_priority INTEGER NOT NULL".to_string());

        let mut names: Vec<&str> = vec!["business_key"];
        names.extend(columns.iter().map(|c| c.name));
        names.push("data_source");
        names.push("source_priority");
        let placeholders = vec!["?"; names.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE {table} ({})", ddl.join(", ")))
            .execute(&mut *tx)
            .await?;
        for row in &view.rows {
            let mut query = sqlx::query(&insert_sql).bind(&row.business_key);
            for column in &columns {
                query = bind_value(query, row.get(column.name));
            }
            query = query.bind(row.data_source.as_str());
            query = query.bind(row.source_priority);
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(view)
    }

    async fn check_join_keys(
        &self,
        schema: &EntitySchema,
        csv_table: &str,
        json_table: &str,
    ) -> Result<(), ReconcileError> {
        let csv_key = schema.business_key(DataSource::Csv);
        let json_key = schema.business_key(DataSource::Json);
        let csv_cols = physical_columns(self.pool, csv_table).await?;
        let json_cols = physical_columns(self.pool, json_table).await?;

        // A missing table is an empty side, not a mismatch; a present
        // table without its key column is the defect this error exists
        // for.
        let csv_bad = !csv_cols.is_empty() && !csv_cols.iter().any(|c| c == csv_key);
        let json_bad = !json_cols.is_empty() && !json_cols.iter().any(|c| c == json_key);
        if csv_bad || json_bad {
            return Err(ReconcileError::SchemaMismatch {
                entity: schema.name().to_string(),
                csv_key: csv_key.to_string(),
                json_key: json_key.to_string(),
                csv_table: csv_table.to_string(),
                json_table: json_table.to_string(),
            });
        }
        Ok(())
    }

    async fn load_side(
        &self,
        schema: &EntitySchema,
        source: DataSource,
    ) -> Result<Vec<BTreeMap<String, ScalarValue>>, ReconcileError> {
        let table = table_name(source, schema.name());
        let physical = physical_columns(self.pool, &table).await?;
        if physical.is_empty() {
            return Ok(Vec::new());
        }

        // Select only declared columns that physically exist; a column
        // added to the registry before the table was migrated reads as
        // null rather than failing the whole pass.
        let columns: Vec<&ColumnDef> = schema.columns(source).collect();
        let present: Vec<&ColumnDef> = columns
            .iter()
            .copied()
            .filter(|c| physical.iter().any(|p| p == c.name))
            .collect();
        let select_list: Vec<&str> = present.iter().map(|c| c.name).collect();
        // Stable read order so line items keep their storage order.
        let sql = format!(
            "SELECT {} FROM {table} ORDER BY rowid",
            select_list.join(", ")
        );

        let fetched = sqlx::query(&sql).fetch_all(self.pool).await?;
        let mut rows = Vec::with_capacity(fetched.len());
        for fetched_row in &fetched {
            let mut row = BTreeMap::new();
            for column in &columns {
                let value = if present.iter().any(|c| c.name == column.name) {
                    read_value(fetched_row, column.name, column.ty)?
                } else {
                    ScalarValue::Null
                };
                row.insert(column.name.to_string(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn merge_pair(
        &self,
        key: &str,
        csv_row: &BTreeMap<String, ScalarValue>,
        json_row: &BTreeMap<String, ScalarValue>,
        shared: &[ColumnDef],
        csv_only: &[ColumnDef],
        json_only: &[ColumnDef],
    ) -> MergedRow {
        let mut values = BTreeMap::new();
        for column in shared {
            let csv_value = csv_row.get(column.name).cloned().unwrap_or(ScalarValue::Null);
            let json_value = json_row.get(column.name).cloned().unwrap_or(ScalarValue::Null);
            let (winner, fallback) = match self.precedence {
                MergePrecedence::JsonWins => (json_value, csv_value),
                MergePrecedence::CsvWins => (csv_value, json_value),
            };
            let merged = if winner.is_null() { fallback } else { winner };
            values.insert(column.name.to_string(), merged);
        }
        for column in csv_only {
            values.insert(
                column.name.to_string(),
                csv_row.get(column.name).cloned().unwrap_or(ScalarValue::Null),
            );
        }
        for column in json_only {
            values.insert(
                column.name.to_string(),
                json_row.get(column.name).cloned().unwrap_or(ScalarValue::Null),
            );
        }
        MergedRow {
            business_key: key.to_string(),
            data_source: MergeLabel::Merged,
            source_priority: MergeLabel::Merged.priority(),
            values,
        }
    }
}

fn passthrough(
    key: &str,
    row: &BTreeMap<String, ScalarValue>,
    label: MergeLabel,
    shared: &[ColumnDef],
    csv_only: &[ColumnDef],
    json_only: &[ColumnDef],
) -> MergedRow {
    let mut values = BTreeMap::new();
    for column in shared.iter().chain(csv_only).chain(json_only) {
        values.insert(
            column.name.to_string(),
            row.get(column.name).cloned().unwrap_or(ScalarValue::Null),
        );
    }
    MergedRow {
        business_key: key.to_string(),
        data_source: label,
        source_priority: label.priority(),
        values,
    }
}

fn output_columns(schema: &EntitySchema) -> Vec<ColumnDef> {
    schema
        .shared_columns()
        .iter()
        .chain(schema.source_only_columns(DataSource::Csv))
        .chain(schema.source_only_columns(DataSource::Json))
        .copied()
        .collect()
}

fn compute_stats(
    schema: &EntitySchema,
    csv_rows: &[BTreeMap<String, ScalarValue>],
    json_rows: &[BTreeMap<String, ScalarValue>],
    out: &[MergedRow],
) -> ViewStats {
    let mut distinct: Vec<&str> = out.iter().map(|r| r.business_key.as_str()).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let mut line_items_per_key = BTreeMap::new();
    if schema.has_line_items() {
        let json_key = schema.business_key(DataSource::Json);
        for row in json_rows {
            if let Some(key) = row.get(json_key).and_then(ScalarValue::as_key) {
                *line_items_per_key.entry(key).or_insert(0) += 1;
            }
        }
    }

    ViewStats {
        csv_rows: csv_rows.len(),
        json_rows: json_rows.len(),
        output_rows: out.len(),
        distinct_business_keys: distinct.len(),
        line_items_per_key,
    }
}
