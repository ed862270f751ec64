use serde::{Deserialize, Serialize};

use crate::normalize::normalize_column_name;
use crate::record::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl ColumnType {
    /// SQLite storage class for the column. Decimals and dates are kept
    /// as TEXT so values round-trip exactly.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Text | ColumnType::Decimal | ColumnType::Date => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef { name, ty }
}

use ColumnType::{Date, Decimal, Text};

/// Flattened line-item fields for document entities. Each line item
/// becomes its own row in the JSON-side table, sharing the parent's
/// business key.
const LINE_ITEM_COLUMNS: [ColumnDef; 6] = [
    col("line_item_id", Text),
    col("item_id", Text),
    col("item_name", Text),
    col("quantity", Decimal),
    col("rate", Decimal),
    col("item_total", Decimal),
];

/// System-timestamp fallbacks for business-date resolution, tried in
/// order after the entity-specific fields and the generic `date` column.
const GENERIC_TIMESTAMP_FIELDS: [&str; 4] = [
    "created_time",
    "last_modified_time",
    "updated_time",
    "modified_time",
];

/// Static description of one logical entity: canonical columns split by
/// which source supplies them, per-source business-key field names, and
/// the business-date priority list.
///
/// The per-source key names exist because the same logical field is
/// named differently per source (CSV `customer_payment_id` vs JSON
/// `payment_id`, CSV `sales_order_id` vs JSON `salesorder_id`). Joins
/// that assume identical key names across sources are exactly the bug
/// this table prevents.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: &'static str,
    shared: Vec<ColumnDef>,
    csv_only: Vec<ColumnDef>,
    json_only: Vec<ColumnDef>,
    csv_key: &'static str,
    json_key: &'static str,
    date_priority: Vec<&'static str>,
    has_line_items: bool,
}

impl EntitySchema {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The business-key column name as stored for the given source.
    pub fn business_key(&self, source: DataSource) -> &'static str {
        match source {
            DataSource::Csv => self.csv_key,
            DataSource::Json => self.json_key,
        }
    }

    pub fn has_line_items(&self) -> bool {
        self.has_line_items
    }

    /// Full canonical column set for one source's table, shared columns
    /// first. Does not include the bookkeeping columns (`data_source`,
    /// `synced_at`) the store appends.
    pub fn columns(&self, source: DataSource) -> impl Iterator<Item = &ColumnDef> {
        let side = match source {
            DataSource::Csv => &self.csv_only,
            DataSource::Json => &self.json_only,
        };
        self.shared.iter().chain(side.iter())
    }

    pub fn column_names(&self, source: DataSource) -> Vec<&'static str> {
        self.columns(source).map(|c| c.name).collect()
    }

    /// Columns present in both source tables, eligible for
    /// merge-by-precedence during reconciliation.
    pub fn shared_columns(&self) -> &[ColumnDef] {
        &self.shared
    }

    /// Columns only one source supplies, carried through reconciliation
    /// unchanged.
    pub fn source_only_columns(&self, source: DataSource) -> &[ColumnDef] {
        match source {
            DataSource::Csv => &self.csv_only,
            DataSource::Json => &self.json_only,
        }
    }

    pub fn column_type(&self, source: DataSource, name: &str) -> Option<ColumnType> {
        self.columns(source).find(|c| c.name == name).map(|c| c.ty)
    }

    /// Resolves the field business records should be time-ordered by,
    /// from the columns actually available: the entity-specific business
    /// date first, then the generic `date` column, then system
    /// timestamps. Transactions are ordered by when they occurred, not
    /// by when the sync observed them; reference entities (items,
    /// contacts) rarely carry a business date and fall through to the
    /// system timestamps.
    pub fn business_date_field(&self, available: &[&str]) -> Option<&'static str> {
        self.date_priority
            .iter()
            .copied()
            .chain(std::iter::once("date"))
            .chain(GENERIC_TIMESTAMP_FIELDS)
            .find(|candidate| available.contains(candidate))
    }

    /// The column used to compare record freshness on upsert:
    /// `last_modified_time` when the source carries it, otherwise the
    /// entity's business-date field.
    pub fn freshness_field(&self, source: DataSource) -> Option<&'static str> {
        let names = self.column_names(source);
        if names.contains(&"last_modified_time") {
            return Some("last_modified_time");
        }
        self.business_date_field(&names)
    }
}

/// The static entity catalog. Built once at startup; columns are never
/// discovered by inspecting whatever happens to exist in a table at run
/// time.
#[derive(Debug, Clone)]
pub struct EntitySchemaRegistry {
    schemas: Vec<EntitySchema>,
}

impl EntitySchemaRegistry {
    pub fn new() -> Self {
        let registry = Self {
            schemas: build_schemas(),
        };
        debug_assert!(registry.all_names_canonical());
        registry
    }

    pub fn get(&self, entity: &str) -> Option<&EntitySchema> {
        self.schemas.iter().find(|s| s.name == entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.iter()
    }

    pub fn entity_names(&self) -> Vec<&'static str> {
        self.schemas.iter().map(|s| s.name).collect()
    }

    /// Every declared column, key, and date field must already be in
    /// canonical form, i.e. a fixed point of the normalizer.
    fn all_names_canonical(&self) -> bool {
        self.schemas.iter().all(|s| {
            let columns_ok = s
                .columns(DataSource::Csv)
                .chain(s.columns(DataSource::Json))
                .all(|c| normalize_column_name(c.name) == c.name);
            let keys_ok = normalize_column_name(s.csv_key) == s.csv_key
                && normalize_column_name(s.json_key) == s.json_key;
            let dates_ok = s
                .date_priority
                .iter()
                .all(|d| normalize_column_name(d) == *d);
            columns_ok && keys_ok && dates_ok
        })
    }
}

impl Default for EntitySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct EntityDef {
    name: &'static str,
    csv_key: &'static str,
    json_key: &'static str,
    date_priority: &'static [&'static str],
    shared: &'static [ColumnDef],
    csv_only: &'static [ColumnDef],
    json_only: &'static [ColumnDef],
    has_line_items: bool,
}

impl EntityDef {
    fn build(&self) -> EntitySchema {
        let mut json_only = self.json_only.to_vec();
        if self.has_line_items {
            json_only.extend_from_slice(&LINE_ITEM_COLUMNS);
        }
        EntitySchema {
            name: self.name,
            shared: self.shared.to_vec(),
            csv_only: self.csv_only.to_vec(),
            json_only,
            csv_key: self.csv_key,
            json_key: self.json_key,
            date_priority: self.date_priority.to_vec(),
            has_line_items: self.has_line_items,
        }
    }
}

fn build_schemas() -> Vec<EntitySchema> {
    ENTITY_DEFS.iter().map(EntityDef::build).collect()
}

const ENTITY_DEFS: [EntityDef; 10] = [
    EntityDef {
        name: "invoice",
        csv_key: "invoice_id",
        json_key: "invoice_id",
        date_priority: &["invoice_date"],
        shared: &[
            col("invoice_id", Text),
            col("invoice_number", Text),
            col("customer_id", Text),
            col("customer_name", Text),
            col("invoice_date", Date),
            col("due_date", Date),
            col("status", Text),
            col("currency_code", Text),
            col("total", Decimal),
            col("balance", Decimal),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[col("payment_terms_label", Text)],
        json_only: &[col("salesperson_name", Text)],
        has_line_items: true,
    },
    EntityDef {
        name: "bill",
        csv_key: "bill_id",
        json_key: "bill_id",
        date_priority: &["bill_date"],
        shared: &[
            col("bill_id", Text),
            col("bill_number", Text),
            col("vendor_id", Text),
            col("vendor_name", Text),
            col("bill_date", Date),
            col("due_date", Date),
            col("status", Text),
            col("currency_code", Text),
            col("total", Decimal),
            col("balance", Decimal),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[col("payment_terms_label", Text)],
        json_only: &[col("reference_number", Text)],
        has_line_items: true,
    },
    EntityDef {
        name: "contact",
        csv_key: "contact_id",
        json_key: "contact_id",
        date_priority: &[],
        shared: &[
            col("contact_id", Text),
            col("contact_name", Text),
            col("company_name", Text),
            col("contact_type", Text),
            col("status", Text),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        // The CSV export names the address `EmailID`, which normalizes
        // to `email_id`; the JSON payload uses plain `email`.
        csv_only: &[col("email_id", Text), col("phone", Text)],
        json_only: &[
            col("email", Text),
            col("mobile", Text),
            col("outstanding_receivable_amount", Decimal),
        ],
        has_line_items: false,
    },
    EntityDef {
        name: "item",
        csv_key: "item_id",
        json_key: "item_id",
        date_priority: &[],
        shared: &[
            col("item_id", Text),
            col("item_name", Text),
            col("sku", Text),
            col("description", Text),
            col("rate", Decimal),
            col("status", Text),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[col("usage_unit", Text)],
        json_only: &[col("product_type", Text)],
        has_line_items: false,
    },
    EntityDef {
        name: "sales_order",
        csv_key: "sales_order_id",
        json_key: "salesorder_id",
        date_priority: &["sales_order_date", "order_date"],
        shared: &[
            col("customer_id", Text),
            col("customer_name", Text),
            col("status", Text),
            col("currency_code", Text),
            col("total", Decimal),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[
            col("sales_order_id", Text),
            col("sales_order_number", Text),
            col("order_date", Date),
        ],
        json_only: &[
            col("salesorder_id", Text),
            col("salesorder_number", Text),
            col("date", Date),
        ],
        has_line_items: true,
    },
    EntityDef {
        name: "purchase_order",
        csv_key: "purchase_order_id",
        json_key: "purchaseorder_id",
        date_priority: &["purchase_order_date", "order_date"],
        shared: &[
            col("vendor_id", Text),
            col("vendor_name", Text),
            col("status", Text),
            col("currency_code", Text),
            col("total", Decimal),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[
            col("purchase_order_id", Text),
            col("purchase_order_number", Text),
            col("order_date", Date),
        ],
        json_only: &[
            col("purchaseorder_id", Text),
            col("purchaseorder_number", Text),
            col("date", Date),
            col("delivery_date", Date),
        ],
        has_line_items: true,
    },
    EntityDef {
        name: "customer_payment",
        csv_key: "customer_payment_id",
        json_key: "payment_id",
        date_priority: &["payment_date"],
        shared: &[
            col("customer_id", Text),
            col("customer_name", Text),
            col("payment_mode", Text),
            col("reference_number", Text),
            col("amount", Decimal),
            col("currency_code", Text),
            col("date", Date),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[col("customer_payment_id", Text), col("invoice_number", Text)],
        json_only: &[
            col("payment_id", Text),
            col("payment_number", Text),
            col("unused_amount", Decimal),
        ],
        has_line_items: false,
    },
    EntityDef {
        name: "vendor_payment",
        csv_key: "vendor_payment_id",
        json_key: "payment_id",
        date_priority: &["payment_date"],
        shared: &[
            col("vendor_id", Text),
            col("vendor_name", Text),
            col("payment_mode", Text),
            col("reference_number", Text),
            col("amount", Decimal),
            col("currency_code", Text),
            col("date", Date),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[col("vendor_payment_id", Text), col("bill_number", Text)],
        json_only: &[col("payment_id", Text), col("payment_number", Text)],
        has_line_items: false,
    },
    EntityDef {
        name: "credit_note",
        csv_key: "credit_note_id",
        json_key: "creditnote_id",
        date_priority: &["credit_note_date", "creditnote_date"],
        shared: &[
            col("customer_id", Text),
            col("customer_name", Text),
            col("status", Text),
            col("currency_code", Text),
            col("total", Decimal),
            col("balance", Decimal),
            col("created_time", Date),
            col("last_modified_time", Date),
        ],
        csv_only: &[
            col("credit_note_id", Text),
            col("credit_note_number", Text),
            col("credit_note_date", Date),
        ],
        json_only: &[
            col("creditnote_id", Text),
            col("creditnote_number", Text),
            col("date", Date),
        ],
        has_line_items: true,
    },
    EntityDef {
        name: "organization",
        csv_key: "organization_id",
        json_key: "organization_id",
        date_priority: &[],
        shared: &[
            col("organization_id", Text),
            col("name", Text),
            col("currency_code", Text),
            col("time_zone", Text),
            col("country", Text),
            col("created_time", Date),
        ],
        csv_only: &[],
        json_only: &[col("plan_name", Text)],
        has_line_items: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EntitySchemaRegistry {
        EntitySchemaRegistry::new()
    }

    #[test]
    fn all_ten_entities_are_registered() {
        let names = registry().entity_names();
        for expected in [
            "invoice",
            "bill",
            "contact",
            "item",
            "sales_order",
            "purchase_order",
            "customer_payment",
            "vendor_payment",
            "credit_note",
            "organization",
        ] {
            assert!(names.contains(&expected), "missing entity {expected}");
        }
        assert_eq!(names.len(), 10);
    }

    #[test]
    fn every_declared_name_is_a_normalizer_fixed_point() {
        assert!(registry().all_names_canonical());
    }

    // ── per-source key discrepancies ──────────────────────────────────────────

    #[test]
    fn customer_payment_keys_differ_per_source() {
        let reg = registry();
        let schema = reg.get("customer_payment").unwrap();
        assert_eq!(schema.business_key(DataSource::Csv), "customer_payment_id");
        assert_eq!(schema.business_key(DataSource::Json), "payment_id");
    }

    #[test]
    fn vendor_payment_keys_differ_per_source() {
        let reg = registry();
        let schema = reg.get("vendor_payment").unwrap();
        assert_eq!(schema.business_key(DataSource::Csv), "vendor_payment_id");
        assert_eq!(schema.business_key(DataSource::Json), "payment_id");
    }

    #[test]
    fn sales_order_keys_differ_per_source() {
        let reg = registry();
        let schema = reg.get("sales_order").unwrap();
        assert_eq!(schema.business_key(DataSource::Csv), "sales_order_id");
        assert_eq!(schema.business_key(DataSource::Json), "salesorder_id");
    }

    #[test]
    fn key_column_is_part_of_its_sides_column_set() {
        let reg = registry();
        for schema in reg.entities() {
            for source in [DataSource::Csv, DataSource::Json] {
                let key = schema.business_key(source);
                assert!(
                    schema.column_names(source).contains(&key),
                    "{}: {source} key {key} not in column set",
                    schema.name()
                );
            }
        }
    }

    // ── business-date resolution ──────────────────────────────────────────────

    #[test]
    fn invoice_prefers_invoice_date_over_system_timestamps() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        let available = ["invoice_id", "invoice_date", "created_time"];
        assert_eq!(schema.business_date_field(&available), Some("invoice_date"));
    }

    #[test]
    fn payment_prefers_payment_date_then_generic_date() {
        let reg = registry();
        let schema = reg.get("customer_payment").unwrap();
        assert_eq!(
            schema.business_date_field(&["payment_date", "date"]),
            Some("payment_date")
        );
        assert_eq!(schema.business_date_field(&["date", "created_time"]), Some("date"));
    }

    #[test]
    fn reference_entities_fall_back_to_system_timestamps() {
        let reg = registry();
        let schema = reg.get("contact").unwrap();
        assert_eq!(
            schema.business_date_field(&["contact_id", "created_time"]),
            Some("created_time")
        );
        assert_eq!(schema.business_date_field(&["contact_id"]), None);
    }

    #[test]
    fn system_timestamp_order_is_stable() {
        let reg = registry();
        let schema = reg.get("item").unwrap();
        assert_eq!(
            schema.business_date_field(&["last_modified_time", "updated_time"]),
            Some("last_modified_time")
        );
        assert_eq!(
            schema.business_date_field(&["modified_time", "updated_time"]),
            Some("updated_time")
        );
    }

    // ── freshness and line items ──────────────────────────────────────────────

    #[test]
    fn freshness_prefers_last_modified_time() {
        let reg = registry();
        let schema = reg.get("invoice").unwrap();
        assert_eq!(
            schema.freshness_field(DataSource::Json),
            Some("last_modified_time")
        );
    }

    #[test]
    fn organization_freshness_falls_back_to_created_time() {
        let reg = registry();
        let schema = reg.get("organization").unwrap();
        assert_eq!(schema.freshness_field(DataSource::Csv), Some("created_time"));
    }

    #[test]
    fn document_entities_carry_line_item_columns_on_json_side() {
        let reg = registry();
        for name in ["invoice", "bill", "sales_order", "purchase_order", "credit_note"] {
            let schema = reg.get(name).unwrap();
            assert!(schema.has_line_items(), "{name} should expand line items");
            let json_cols = schema.column_names(DataSource::Json);
            assert!(json_cols.contains(&"line_item_id"), "{name} missing line_item_id");
            assert!(
                !schema.column_names(DataSource::Csv).contains(&"line_item_id"),
                "{name} must not carry line items on the CSV side"
            );
        }
    }

    #[test]
    fn plain_entities_have_no_line_items() {
        let reg = registry();
        for name in ["contact", "item", "customer_payment", "vendor_payment", "organization"] {
            assert!(!reg.get(name).unwrap().has_line_items());
        }
    }
}
