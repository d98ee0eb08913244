//! Row and schema types for the load pipeline.
//!
//! The header row is resolved once into a `Schema`: field names are
//! lower-cased (a collision there is fatal) and the columns the pipeline
//! needs are bound to roles by matching against known candidate names.
//! Rows travel as `NormalizedRecord` (positional values under the schema)
//! until validation extracts the typed `SaleRecord`.

use chrono::NaiveDate;

use crate::error::{LoadError, Result};

/// Known column names per role. Matched against lower-cased headers,
/// exact first, then substring, mirroring how sources label these fields.
pub const CUSTOMER_ID_COLUMNS: &[&str] = &["customer_id", "customerid", "customer", "client_id"];
pub const CUSTOMER_NAME_COLUMNS: &[&str] = &["customer_name", "customername", "client_name"];
pub const PRODUCT_ID_COLUMNS: &[&str] = &["product_id", "productid", "product", "sku"];
pub const PRODUCT_NAME_COLUMNS: &[&str] = &["product_name", "productname", "description"];
pub const QUANTITY_COLUMNS: &[&str] = &["quantity", "qty", "units"];
pub const PRICE_COLUMNS: &[&str] = &["price", "unit_price", "amount"];
pub const DATE_COLUMNS: &[&str] = &["transaction_date", "sale_date", "date", "fecha"];

/// Date formats accepted for the transaction date, tried in order.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y%m%d"];

/// One field value as read from the source: untyped text, a number, or
/// nothing at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Missing,
}

impl Value {
    /// Type a raw CSV field: empty → Missing, numeric → Number, else Text.
    pub fn from_raw(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::Text(trimmed.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

/// Column indices for the roles the pipeline needs. Name columns are
/// optional; everything else is required.
#[derive(Debug, Clone)]
pub struct ColumnRoles {
    pub customer_id: usize,
    pub customer_name: Option<usize>,
    pub product_id: usize,
    pub product_name: Option<usize>,
    pub quantity: usize,
    pub price: usize,
    pub date: usize,
}

/// The source file's field set, resolved once from the header row.
#[derive(Debug, Clone)]
pub struct Schema {
    pub fields: Vec<String>,
    pub roles: ColumnRoles,
}

/// Find a column index by candidate names: exact match wins over substring.
fn find_column(fields: &[String], candidates: &'static [&'static str]) -> Option<usize> {
    for candidate in candidates {
        if let Some(idx) = fields.iter().position(|f| f == candidate) {
            return Some(idx);
        }
    }
    for candidate in candidates {
        if let Some(idx) = fields.iter().position(|f| f.contains(candidate)) {
            return Some(idx);
        }
    }
    None
}

fn require_column(
    fields: &[String],
    candidates: &'static [&'static str],
) -> Result<usize> {
    find_column(fields, candidates).ok_or(LoadError::MissingColumn(candidates))
}

impl Schema {
    /// Resolve a header row into a schema. Field names are lower-cased
    /// here; two headers collapsing to the same name is fatal.
    pub fn from_headers<I, S>(headers: I) -> Result<Schema>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<String> = headers
            .into_iter()
            // Strip a UTF-8 BOM if the exporter left one on the first header.
            .map(|h| h.as_ref().trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();

        for (i, name) in fields.iter().enumerate() {
            if fields[..i].contains(name) {
                return Err(LoadError::NameCollision(name.clone()));
            }
        }

        let roles = ColumnRoles {
            customer_id: require_column(&fields, CUSTOMER_ID_COLUMNS)?,
            customer_name: find_column(&fields, CUSTOMER_NAME_COLUMNS),
            product_id: require_column(&fields, PRODUCT_ID_COLUMNS)?,
            product_name: find_column(&fields, PRODUCT_NAME_COLUMNS),
            quantity: require_column(&fields, QUANTITY_COLUMNS)?,
            price: require_column(&fields, PRICE_COLUMNS)?,
            date: require_column(&fields, DATE_COLUMNS)?,
        };

        Ok(Schema { fields, roles })
    }
}

/// One source row under a schema: field names already lower-cased, text
/// values already upper-cased. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub values: Vec<Value>,
    /// 1-based source line, for warnings (header is line 1).
    pub line: usize,
}

impl NormalizedRecord {
    pub fn get(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Missing)
    }
}

/// A validated, typed sales row. Produced by the validator, consumed by
/// every later stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleRecord {
    pub customer_id: String,
    pub customer_name: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    pub price: f64,
    pub transaction_date: NaiveDate,
    pub line: usize,
}

impl SaleRecord {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            customer_id: self.customer_id.clone(),
            product_id: self.product_id.clone(),
            transaction_date: self.transaction_date,
        }
    }
}

/// The business-key tuple used for fact deduplication, computed from the
/// normalized (and, when enabled, encrypted) field values so it compares
/// identically with what the warehouse stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub customer_id: String,
    pub product_id: String,
    pub transaction_date: NaiveDate,
}

/// Parse a transaction date, accepting the formats sources actually use.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// A customer dimension row: one per distinct natural customer key.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerDimensionRow {
    pub customer_sk: i64,
    pub customer_id: String,
    pub customer_name: String,
}

/// A product dimension row, analogous to the customer dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductDimensionRow {
    pub product_sk: i64,
    pub product_id: String,
    pub product_name: String,
}

/// One sales transaction referencing resolved surrogate keys. Write-once.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub customer_sk: i64,
    pub product_sk: i64,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: f64,
    pub price: f64,
    pub transaction_date: NaiveDate,
}

// =============================================================================
// TESTS
// =============================================================================
