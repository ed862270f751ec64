use std::collections::BTreeMap;

use booksync_core::{
    canonicalize_timestamp, normalize_column_name, CanonicalRow, ColumnType, DataSource,
    EntitySchema, RawRecord, ScalarValue,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A record without a usable business key can never be upserted or
    /// reconciled; it is skipped and counted, never stored with a null key.
    #[error("{entity} record from {data_source} is missing business key '{key}'")]
    MissingBusinessKey {
        entity: &'static str,
        data_source: DataSource,
        key: &'static str,
    },
}

/// Result of ingesting one raw record: the storage-ready rows (more
/// than one when line items expand) and how many optional fields were
/// degraded to null on the way.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub rows: Vec<CanonicalRow>,
    pub warnings: usize,
}

/// Normalizes keys, coerces values to their declared column types, and
/// expands JSON line items into per-line rows sharing the parent's
/// business key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordIngestor;

impl RecordIngestor {
    pub fn new() -> Self {
        Self
    }

    pub fn ingest(
        &self,
        schema: &EntitySchema,
        source: DataSource,
        raw: &RawRecord,
    ) -> Result<IngestOutcome, IngestError> {
        let mut warnings = 0usize;

        let mut normalized: BTreeMap<String, &Value> = BTreeMap::new();
        let mut line_items: Option<&Vec<Value>> = None;
        for (key, value) in raw {
            let canonical = normalize_column_name(key);
            if canonical == "line_items" {
                if let Value::Array(items) = value {
                    line_items = Some(items);
                }
                continue;
            }
            // First occurrence wins when two raw keys normalize to the
            // same canonical name.
            normalized.entry(canonical).or_insert(value);
        }

        let mut values = BTreeMap::new();
        for column in schema.columns(source) {
            let coerced = coerce_value(
                normalized.get(column.name).copied(),
                column.ty,
                schema.name(),
                column.name,
            );
            match coerced {
                Coerced::Value(v) => {
                    values.insert(column.name.to_string(), v);
                }
                Coerced::Degraded => {
                    warnings += 1;
                    values.insert(column.name.to_string(), ScalarValue::Null);
                }
            }
        }

        let base = CanonicalRow {
            entity: schema.name().to_string(),
            data_source: source,
            synced_at: Utc::now(),
            values,
        };

        let key_column = schema.business_key(source);
        if base.key_value(key_column).is_none() {
            return Err(IngestError::MissingBusinessKey {
                entity: schema.name(),
                data_source: source,
                key: key_column,
            });
        }

        let rows = match line_items {
            Some(items)
                if source == DataSource::Json && schema.has_line_items() && !items.is_empty() =>
            {
                items
                    .iter()
                    .map(|item| {
                        let mut row = base.clone();
                        if let Value::Object(fields) = item {
                            warnings += overlay_line_item(schema, &mut row, fields);
                        }
                        row
                    })
                    .collect()
            }
            _ => vec![base],
        };

        Ok(IngestOutcome { rows, warnings })
    }
}

/// Writes one line item's fields over a clone of the parent row. Only
/// columns declared as line-item fields for the entity are taken; the
/// parent's business key stays in place, which is what makes the
/// one-to-many expansion joinable later.
fn overlay_line_item(
    schema: &EntitySchema,
    row: &mut CanonicalRow,
    fields: &serde_json::Map<String, Value>,
) -> usize {
    let mut warnings = 0;
    for (key, value) in fields {
        let canonical = normalize_column_name(key);
        let Some(ty) = schema.column_type(DataSource::Json, &canonical) else {
            continue;
        };
        if !row.get(&canonical).is_null() {
            // Parent-level fields (customer_name etc.) are not
            // overwritten by line-item fields of the same name.
            continue;
        }
        match coerce_value(Some(value), ty, schema.name(), &canonical) {
            Coerced::Value(v) => {
                row.values.insert(canonical, v);
            }
            Coerced::Degraded => {
                warnings += 1;
            }
        }
    }
    warnings
}

enum Coerced {
    Value(ScalarValue),
    /// The source value existed but could not be coerced; stored as
    /// null and counted.
    Degraded,
}

fn coerce_value(
    value: Option<&Value>,
    ty: ColumnType,
    entity: &str,
    column: &str,
) -> Coerced {
    let Some(value) = value else {
        return Coerced::Value(ScalarValue::Null);
    };
    match try_coerce(value, ty) {
        Some(v) => Coerced::Value(v),
        None => {
            tracing::warn!(
                entity,
                column,
                value = %value,
                "could not coerce field to {ty:?}, storing null"
            );
            Coerced::Degraded
        }
    }
}

fn try_coerce(value: &Value, ty: ColumnType) -> Option<ScalarValue> {
    match value {
        Value::Null => return Some(ScalarValue::Null),
        Value::String(s) if s.trim().is_empty() => return Some(ScalarValue::Null),
        _ => {}
    }
    match ty {
        ColumnType::Text => match value {
            Value::String(s) => Some(ScalarValue::Text(s.trim().to_string())),
            // Upstream IDs arrive both quoted and bare; serde_json keeps
            // 64-bit integers exact, so formatting preserves all digits.
            Value::Number(n) => Some(ScalarValue::Text(n.to_string())),
            Value::Bool(b) => Some(ScalarValue::Text(b.to_string())),
            _ => None,
        },
        ColumnType::Integer => match value {
            Value::Number(n) => n.as_i64().map(ScalarValue::Integer),
            Value::String(s) => s.trim().parse::<i64>().ok().map(ScalarValue::Integer),
            _ => None,
        },
        ColumnType::Decimal => match value {
            Value::Number(n) => n.to_string().parse::<Decimal>().ok().map(ScalarValue::Decimal),
            Value::String(s) => {
                let cleaned = s.trim().replace([',', '$', ' '], "");
                cleaned.parse::<Decimal>().ok().map(ScalarValue::Decimal)
            }
            _ => None,
        },
        ColumnType::Date => match value {
            Value::String(s) => canonicalize_timestamp(s).map(ScalarValue::Text),
            _ => None,
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Some(ScalarValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(ScalarValue::Boolean(false)),
                Some(1) => Some(ScalarValue::Boolean(true)),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(ScalarValue::Boolean(true)),
                "false" | "0" | "no" => Some(ScalarValue::Boolean(false)),
                _ => None,
            },
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booksync_core::EntitySchemaRegistry;
    use serde_json::json;

    fn registry() -> EntitySchemaRegistry {
        EntitySchemaRegistry::new()
    }

    fn as_record(value: serde_json::Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be a JSON object"),
        }
    }

    #[test]
    fn normalizes_csv_style_keys() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({
            "Invoice ID": "3990265000000897001",
            "Invoice Number": "INV-001",
            "Invoice Date": "2024-01-15",
            "Total": "1,500.00",
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Csv, &raw)
            .unwrap();
        let row = &outcome.rows[0];
        assert_eq!(
            row.get("invoice_id"),
            &ScalarValue::Text("3990265000000897001".into())
        );
        assert_eq!(row.get("invoice_number"), &ScalarValue::Text("INV-001".into()));
        assert_eq!(
            row.get("total"),
            &ScalarValue::Decimal("1500.00".parse().unwrap())
        );
    }

    #[test]
    fn nineteen_digit_numeric_id_is_preserved_exactly() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        // Bare JSON number, not a string: the worst case for precision.
        let raw = as_record(json!({
            "invoice_id": 3990265000000897001u64,
            "invoice_number": "INV-002",
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        assert_eq!(
            outcome.rows[0].get("invoice_id"),
            &ScalarValue::Text("3990265000000897001".into())
        );
    }

    #[test]
    fn unknown_fields_are_dropped_and_missing_become_null() {
        let reg = registry();
        let schema = reg.get("item").unwrap();
        let raw = as_record(json!({
            "item_id": "IT-1",
            "item_name": "Widget",
            "some_future_field": "ignored",
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        let row = &outcome.rows[0];
        assert!(!row.values.contains_key("some_future_field"));
        assert_eq!(row.get("sku"), &ScalarValue::Null);
        assert_eq!(outcome.warnings, 0);
    }

    #[test]
    fn malformed_optional_field_degrades_to_null_with_warning() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({
            "invoice_id": "399001",
            "invoice_date": "someday soon",
            "total": "not-a-number",
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        let row = &outcome.rows[0];
        assert_eq!(row.get("invoice_date"), &ScalarValue::Null);
        assert_eq!(row.get("total"), &ScalarValue::Null);
        assert_eq!(outcome.warnings, 2);
    }

    #[test]
    fn missing_business_key_is_a_hard_failure() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({ "invoice_number": "INV-003" }));
        let err = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingBusinessKey { entity: "invoice", key: "invoice_id", .. }
        ));
    }

    #[test]
    fn blank_business_key_is_also_rejected() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({ "invoice_id": "   " }));
        assert!(RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .is_err());
    }

    #[test]
    fn dates_are_canonicalized() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({
            "invoice_id": "399001",
            "invoice_date": "2024-01-15",
            "last_modified_time": "2024-01-15T10:30:00+0530",
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        let row = &outcome.rows[0];
        assert_eq!(row.get("invoice_date"), &ScalarValue::Text("2024-01-15".into()));
        assert_eq!(
            row.get("last_modified_time"),
            &ScalarValue::Text("2024-01-15T05:00:00Z".into())
        );
    }

    // ── line-item expansion ───────────────────────────────────────────────────

    #[test]
    fn json_line_items_expand_to_one_row_each() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({
            "invoice_id": "399001",
            "invoice_number": "INV-001",
            "line_items": [
                { "line_item_id": "LI-1", "item_name": "Widget", "quantity": 2, "rate": 10.0, "item_total": 20.0 },
                { "line_item_id": "LI-2", "item_name": "Gadget", "quantity": 1, "rate": 5.0, "item_total": 5.0 },
                { "line_item_id": "LI-3", "item_name": "Gizmo", "quantity": 4, "rate": 1.0, "item_total": 4.0 },
            ],
        }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        assert_eq!(outcome.rows.len(), 3);
        for row in &outcome.rows {
            // Every expanded row keeps the parent's business key.
            assert_eq!(row.get("invoice_id"), &ScalarValue::Text("399001".into()));
        }
        assert_eq!(outcome.rows[1].get("line_item_id"), &ScalarValue::Text("LI-2".into()));
        assert_eq!(
            outcome.rows[2].get("quantity"),
            &ScalarValue::Decimal("4".parse().unwrap())
        );
    }

    #[test]
    fn record_without_line_items_yields_single_row() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let raw = as_record(json!({ "invoice_id": "399002", "line_items": [] }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Json, &raw)
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].get("line_item_id"), &ScalarValue::Null);
    }

    #[test]
    fn csv_rows_never_expand() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        // A CSV export cannot nest; even if a column normalizes to
        // line_items it is not an array and is ignored.
        let raw = as_record(json!({ "Invoice ID": "399003", "Line Items": "3" }));
        let outcome = RecordIngestor::new()
            .ingest(schema, DataSource::Csv, &raw)
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
    }

    #[test]
    fn every_row_has_identical_column_set() {
        let reg = registry();
        let schema = reg.get("bill").unwrap();
        let sparse = as_record(json!({ "bill_id": "B-1" }));
        let full = as_record(json!({
            "bill_id": "B-2",
            "bill_number": "BILL-002",
            "vendor_name": "Acme",
            "total": 99.5,
        }));
        let ingestor = RecordIngestor::new();
        let a = ingestor.ingest(schema, DataSource::Json, &sparse).unwrap();
        let b = ingestor.ingest(schema, DataSource::Json, &full).unwrap();
        let cols_a: Vec<_> = a.rows[0].values.keys().collect();
        let cols_b: Vec<_> = b.rows[0].values.keys().collect();
        assert_eq!(cols_a, cols_b);
    }
}
