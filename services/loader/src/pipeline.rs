//! The chunk pipeline: normalize → validate → encrypt → dedup →
//! dimensions → facts.
//!
//! Every stage is pure over its batch except the deduplication filter and
//! the dimension extractor, which advance run-scoped state (the composite
//! key set and the surrogate-key cache) owned by the orchestrator.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use crate::config::{EncryptionConfig, MissingPolicy, OutlierMethod, ValidationConfig};
use crate::error::{LoadError, Result};
use crate::record::{
    parse_date, CompositeKey, CustomerDimensionRow, FactRow, NormalizedRecord,
    ProductDimensionRow, SaleRecord, Schema, Value,
};

/// Sentinel default for repairable text fields.
const DEFAULT_NAME: &str = "UNKNOWN";

// =============================================================================
// Normalizer
// =============================================================================

/// Normalize one value: textual values upper-cased, everything else passes
/// through. Idempotent.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Text(s) => Value::Text(s.to_uppercase()),
        other => other,
    }
}

/// Normalize a batch of raw rows under a schema whose field names were
/// already lower-cased at binding time. Same order, same count.
pub fn normalize_batch(rows: Vec<(usize, Vec<String>)>) -> Vec<NormalizedRecord> {
    rows.into_iter()
        .map(|(line, fields)| NormalizedRecord {
            values: fields
                .iter()
                .map(|raw| normalize_value(Value::from_raw(raw)))
                .collect(),
            line,
        })
        .collect()
}

// =============================================================================
// Validator
// =============================================================================

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub records: Vec<SaleRecord>,
    pub rejected: usize,
    pub repaired: usize,
}

/// Per-field bounds for the outlier check, resolved per batch.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: Option<f64>,
    max: Option<f64>,
}

impl Bounds {
    fn contains(&self, v: f64) -> bool {
        self.min.map_or(true, |m| v >= m) && self.max.map_or(true, |m| v <= m)
    }
}

/// Compute outlier bounds for one numeric column over the batch.
fn outlier_bounds(policy: &ValidationConfig, batch: &[NormalizedRecord], col: usize) -> Bounds {
    match policy.outlier_method {
        OutlierMethod::None => Bounds { min: None, max: None },
        OutlierMethod::Range => Bounds { min: policy.min_value, max: policy.max_value },
        OutlierMethod::Zscore => {
            let values: Vec<f64> = batch
                .iter()
                .filter_map(|r| match r.get(col) {
                    Value::Number(n) => Some(*n),
                    _ => None,
                })
                .collect();
            if values.len() < 2 {
                return Bounds { min: None, max: None };
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let stddev = variance.sqrt();
            if stddev == 0.0 {
                return Bounds { min: None, max: None };
            }
            Bounds {
                min: Some(mean - policy.outlier_k * stddev),
                max: Some(mean + policy.outlier_k * stddev),
            }
        }
    }
}

/// A natural key or date column: never repairable.
fn required_text(record: &NormalizedRecord, col: usize) -> Option<String> {
    match record.get(col) {
        Value::Text(s) => Some(s.clone()),
        // Purely numeric ids are legal; carry them as their integer form.
        Value::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        Value::Number(n) => Some(format!("{}", n)),
        Value::Missing => None,
    }
}

/// An optional descriptive column, repairable under the `default` policy.
/// Returns (value, repaired) or None for a rejection.
fn name_field(
    record: &NormalizedRecord,
    col: Option<usize>,
    fallback: &str,
    policy: MissingPolicy,
) -> Option<(String, bool)> {
    let Some(col) = col else {
        // Column absent from the source entirely: not a row defect.
        return Some((fallback.to_string(), false));
    };
    match record.get(col) {
        Value::Text(s) => Some((s.clone(), false)),
        Value::Number(n) => Some((format!("{}", n), false)),
        Value::Missing => match policy {
            MissingPolicy::Default => Some((DEFAULT_NAME.to_string(), true)),
            MissingPolicy::Reject => None,
        },
    }
}

/// A numeric measure column. Returns (value, repaired) or None.
fn measure_field(
    record: &NormalizedRecord,
    col: usize,
    bounds: Bounds,
    policy: MissingPolicy,
) -> Option<(f64, bool)> {
    let value = match record.get(col) {
        Value::Number(n) => Some(*n),
        // Text in a measure column is an invalid value, same as missing.
        Value::Text(_) | Value::Missing => None,
    };
    match value {
        Some(v) if bounds.contains(v) => Some((v, false)),
        // Missing, non-numeric, or flagged as an outlier: policy decides.
        _ => match policy {
            MissingPolicy::Default => Some((0.0, true)),
            MissingPolicy::Reject => None,
        },
    }
}

fn date_field(record: &NormalizedRecord, col: usize) -> Option<chrono::NaiveDate> {
    match record.get(col) {
        Value::Text(s) => parse_date(s),
        Value::Number(n) if n.fract() == 0.0 => parse_date(&format!("{}", *n as i64)),
        _ => None,
    }
}

/// Validate a batch and extract typed sales records. Rows that fail are
/// counted and logged at WARN; a bad row never aborts the batch.
pub fn validate_batch(
    schema: &Schema,
    policy: &ValidationConfig,
    batch: &[NormalizedRecord],
) -> ValidationOutcome {
    let roles = &schema.roles;
    let qty_bounds = outlier_bounds(policy, batch, roles.quantity);
    let price_bounds = outlier_bounds(policy, batch, roles.price);

    let mut outcome = ValidationOutcome::default();

    'rows: for record in batch {
        let mut repaired = false;

        let Some(customer_id) = required_text(record, roles.customer_id) else {
            warn!(line = record.line, "rejected: missing customer id");
            outcome.rejected += 1;
            continue;
        };
        let Some(product_id) = required_text(record, roles.product_id) else {
            warn!(line = record.line, "rejected: missing product id");
            outcome.rejected += 1;
            continue;
        };
        let Some(transaction_date) = date_field(record, roles.date) else {
            warn!(line = record.line, "rejected: missing or unparseable transaction date");
            outcome.rejected += 1;
            continue;
        };

        let names = [
            (roles.customer_name, customer_id.as_str(), "customer name"),
            (roles.product_name, product_id.as_str(), "product name"),
        ];
        let mut resolved_names = Vec::with_capacity(2);
        for (col, fallback, label) in names {
            match name_field(record, col, fallback, policy.missing_policy) {
                Some((value, was_repaired)) => {
                    repaired |= was_repaired;
                    resolved_names.push(value);
                }
                None => {
                    warn!(line = record.line, "rejected: missing {}", label);
                    outcome.rejected += 1;
                    continue 'rows;
                }
            }
        }

        let measures = [
            (roles.quantity, qty_bounds, "quantity"),
            (roles.price, price_bounds, "price"),
        ];
        let mut resolved_measures = Vec::with_capacity(2);
        for (col, bounds, label) in measures {
            match measure_field(record, col, bounds, policy.missing_policy) {
                Some((value, was_repaired)) => {
                    repaired |= was_repaired;
                    resolved_measures.push(value);
                }
                None => {
                    warn!(line = record.line, "rejected: missing, invalid or outlier {}", label);
                    outcome.rejected += 1;
                    continue 'rows;
                }
            }
        }

        if repaired {
            outcome.repaired += 1;
        }
        outcome.records.push(SaleRecord {
            customer_id,
            customer_name: resolved_names[0].clone(),
            product_id,
            product_name: resolved_names[1].clone(),
            quantity: resolved_measures[0],
            price: resolved_measures[1],
            transaction_date,
            line: record.line,
        });
    }

    outcome
}

// =============================================================================
// Encryptor
// =============================================================================

/// Symmetric field-level encryption: plaintext bytes XORed against the
/// cycled key, carried as base64 so the ciphertext stays text-safe in the
/// warehouse. Disabled encryption is the identity transform.
#[derive(Debug, Clone)]
pub struct Encryptor {
    enabled: bool,
    key: Vec<u8>,
    fields: Vec<String>,
}

impl Encryptor {
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        if config.encrypt && config.key.is_empty() {
            return Err(LoadError::Config(
                "encryption.encrypt is enabled but encryption.key is empty".to_string(),
            ));
        }
        Ok(Self {
            enabled: config.encrypt,
            key: config.key.as_bytes().to_vec(),
            fields: config.fields.iter().map(|f| f.to_lowercase()).collect(),
        })
    }

    fn keystream_xor(&self, bytes: &[u8]) -> Vec<u8> {
        if self.key.is_empty() {
            return bytes.to_vec();
        }
        bytes
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }

    pub fn encrypt_str(&self, plaintext: &str) -> String {
        BASE64.encode(self.keystream_xor(plaintext.as_bytes()))
    }

    pub fn decrypt_str(&self, ciphertext: &str) -> Result<String> {
        let bytes = BASE64
            .decode(ciphertext)
            .map_err(|e| LoadError::Fatal(format!("invalid ciphertext: {}", e)))?;
        String::from_utf8(self.keystream_xor(&bytes))
            .map_err(|e| LoadError::Fatal(format!("decrypted value is not valid UTF-8: {}", e)))
    }

    /// Replace the configured sensitive fields with their ciphertext.
    /// Only textual fields are eligible; unknown names are ignored.
    pub fn encrypt_batch(&self, records: &mut [SaleRecord]) {
        if !self.enabled {
            return;
        }
        for record in records {
            for field in &self.fields {
                match field.as_str() {
                    "customer_name" => record.customer_name = self.encrypt_str(&record.customer_name),
                    "product_name" => record.product_name = self.encrypt_str(&record.product_name),
                    "customer_id" => record.customer_id = self.encrypt_str(&record.customer_id),
                    "product_id" => record.product_id = self.encrypt_str(&record.product_id),
                    _ => {}
                }
            }
        }
    }
}

// =============================================================================
// DeduplicationFilter
// =============================================================================

/// Drop rows whose CompositeKey is already in `seen`. The set is seeded
/// from the warehouse at run start and advanced here, so the filter also
/// dedups within a batch (first occurrence wins) and across the run's own
/// chunks. Returns the surviving rows and the number dropped.
pub fn dedup_batch(
    batch: Vec<SaleRecord>,
    seen: &mut HashSet<CompositeKey>,
) -> (Vec<SaleRecord>, usize) {
    let before = batch.len();
    let survivors: Vec<SaleRecord> = batch
        .into_iter()
        .filter(|record| seen.insert(record.composite_key()))
        .collect();
    let dropped = before - survivors.len();
    (survivors, dropped)
}

// =============================================================================
// DimensionExtractor
// =============================================================================

/// Natural key → surrogate key assignments for one run, seeded from the
/// warehouse. Counters advance monotonically from max(existing) + 1, so a
/// natural key resolves to the same surrogate key across all chunks.
#[derive(Debug)]
pub struct DimensionCache {
    customers: HashMap<String, i64>,
    products: HashMap<String, i64>,
    next_customer_sk: i64,
    next_product_sk: i64,
}

impl DimensionCache {
    pub fn seed(customers: HashMap<String, i64>, products: HashMap<String, i64>) -> Self {
        let next_customer_sk = customers.values().max().copied().unwrap_or(0) + 1;
        let next_product_sk = products.values().max().copied().unwrap_or(0) + 1;
        Self { customers, products, next_customer_sk, next_product_sk }
    }

    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }
}

/// A batch's dimension output: the rows not yet known to the warehouse,
/// plus every surviving record tagged with its resolved surrogate keys.
#[derive(Debug, Default)]
pub struct DimensionBatch {
    pub new_customers: Vec<CustomerDimensionRow>,
    pub new_products: Vec<ProductDimensionRow>,
    pub resolved: Vec<ResolvedRecord>,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub record: SaleRecord,
    pub customer_sk: i64,
    pub product_sk: i64,
}

pub fn extract_dimensions(cache: &mut DimensionCache, batch: Vec<SaleRecord>) -> DimensionBatch {
    let mut out = DimensionBatch::default();

    for record in batch {
        let customer_sk = match cache.customers.get(&record.customer_id) {
            Some(&sk) => sk,
            None => {
                let sk = cache.next_customer_sk;
                cache.next_customer_sk += 1;
                cache.customers.insert(record.customer_id.clone(), sk);
                out.new_customers.push(CustomerDimensionRow {
                    customer_sk: sk,
                    customer_id: record.customer_id.clone(),
                    customer_name: record.customer_name.clone(),
                });
                sk
            }
        };

        let product_sk = match cache.products.get(&record.product_id) {
            Some(&sk) => sk,
            None => {
                let sk = cache.next_product_sk;
                cache.next_product_sk += 1;
                cache.products.insert(record.product_id.clone(), sk);
                out.new_products.push(ProductDimensionRow {
                    product_sk: sk,
                    product_id: record.product_id.clone(),
                    product_name: record.product_name.clone(),
                });
                sk
            }
        };

        out.resolved.push(ResolvedRecord { record, customer_sk, product_sk });
    }

    out
}

// =============================================================================
// FactAssembler
// =============================================================================

/// One fact row per surviving source row, in batch order, referencing the
/// resolved surrogate keys.
pub fn assemble_facts(resolved: &[ResolvedRecord]) -> Vec<FactRow> {
    resolved
        .iter()
        .map(|r| FactRow {
            customer_sk: r.customer_sk,
            product_sk: r.product_sk,
            customer_id: r.record.customer_id.clone(),
            product_id: r.record.product_id.clone(),
            quantity: r.record.quantity,
            price: r.record.price,
            transaction_date: r.record.transaction_date,
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_schema() -> Schema {
        Schema::from_headers(["CustomerID", "Product", "Qty", "Price", "Date"]).unwrap()
    }

    fn raw_row(line: usize, fields: &[&str]) -> (usize, Vec<String>) {
        (line, fields.iter().map(|s| s.to_string()).collect())
    }

    fn policy() -> ValidationConfig {
        ValidationConfig::default()
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn sale(customer: &str, product: &str, day: &str) -> SaleRecord {
        SaleRecord {
            customer_id: customer.to_string(),
            customer_name: customer.to_string(),
            product_id: product.to_string(),
            product_name: product.to_string(),
            quantity: 1.0,
            price: 10.0,
            transaction_date: date(day),
            line: 2,
        }
    }

    // -------------------------------------------------------------------------
    // NORMALIZER
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_uppercases_text_only() {
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "5", "9.99", "2024-01-01"])]);
        assert_eq!(batch[0].values[0], Value::Text("C1".to_string()));
        assert_eq!(batch[0].values[1], Value::Text("WIDGET".to_string()));
        assert_eq!(batch[0].values[2], Value::Number(5.0));
        assert_eq!(batch[0].values[3], Value::Number(9.99));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_batch(vec![raw_row(2, &["c1", "Widget Pro", "5", "9.99", "2024-01-01"])]);
        let twice: Vec<Value> = once[0].values.iter().cloned().map(normalize_value).collect();
        assert_eq!(once[0].values, twice);
    }

    #[test]
    fn test_normalize_preserves_order_and_count() {
        let rows = vec![
            raw_row(2, &["a", "x", "1", "1", "2024-01-01"]),
            raw_row(3, &["b", "y", "2", "2", "2024-01-02"]),
        ];
        let batch = normalize_batch(rows);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].line, 2);
        assert_eq!(batch[1].line, 3);
    }

    // -------------------------------------------------------------------------
    // VALIDATOR
    // -------------------------------------------------------------------------

    #[test]
    fn test_negative_price_rejected_as_outlier() {
        // Default policy: range bounds with min 0.
        let schema = test_schema();
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "5", "-3", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &policy(), &batch);
        assert_eq!(outcome.records.len(), 0);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_valid_row_extracted() {
        let schema = test_schema();
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "5", "9.5", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &policy(), &batch);
        assert_eq!(outcome.rejected, 0);
        let record = &outcome.records[0];
        assert_eq!(record.customer_id, "C1");
        assert_eq!(record.product_id, "WIDGET");
        assert_eq!(record.quantity, 5.0);
        assert_eq!(record.price, 9.5);
        assert_eq!(record.transaction_date, date("2024-01-01"));
        // No name columns in this source: names fall back to the ids.
        assert_eq!(record.customer_name, "C1");
        assert_eq!(record.product_name, "WIDGET");
    }

    #[test]
    fn test_missing_measure_rejected_under_reject_policy() {
        let schema = test_schema();
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "", "9.5", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &policy(), &batch);
        assert_eq!(outcome.rejected, 1);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_missing_measure_repaired_under_default_policy() {
        let schema = test_schema();
        let mut p = policy();
        p.missing_policy = MissingPolicy::Default;
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "", "9.5", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &p, &batch);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.repaired, 1);
        assert_eq!(outcome.records[0].quantity, 0.0);
    }

    #[test]
    fn test_missing_natural_key_always_rejected() {
        let schema = test_schema();
        let mut p = policy();
        p.missing_policy = MissingPolicy::Default;
        let batch = normalize_batch(vec![raw_row(2, &["", "widget", "5", "9.5", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &p, &batch);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_unparseable_date_rejected() {
        let schema = test_schema();
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "5", "9.5", "soon"])]);
        let outcome = validate_batch(&schema, &policy(), &batch);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_zscore_flags_extreme_value() {
        let schema = test_schema();
        let mut p = policy();
        p.outlier_method = OutlierMethod::Zscore;
        p.outlier_k = 2.0;
        let mut rows = Vec::new();
        for i in 0..20 {
            rows.push(raw_row(i + 2, &["c1", "widget", "5", "10", "2024-01-01"]));
        }
        rows.push(raw_row(22, &["c1", "widget", "5", "100000", "2024-01-01"]));
        let batch = normalize_batch(rows);
        let outcome = validate_batch(&schema, &p, &batch);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.records.len(), 20);
    }

    #[test]
    fn test_zscore_degenerate_batch_flags_nothing() {
        let schema = test_schema();
        let mut p = policy();
        p.outlier_method = OutlierMethod::Zscore;
        let batch = normalize_batch(vec![raw_row(2, &["c1", "widget", "5", "-3", "2024-01-01"])]);
        let outcome = validate_batch(&schema, &p, &batch);
        // One row: stddev is undefined, the zscore check cannot flag it.
        assert_eq!(outcome.rejected, 0);
    }

    // -------------------------------------------------------------------------
    // ENCRYPTOR
    // -------------------------------------------------------------------------

    fn encryptor(encrypt: bool, key: &str) -> Encryptor {
        Encryptor::from_config(&EncryptionConfig {
            encrypt,
            key: key.to_string(),
            fields: vec!["customer_name".to_string(), "product_name".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn test_encrypt_round_trip() {
        let enc = encryptor(true, "s3cr3t-key");
        for plaintext in ["ACME CORP", "", "ñandú", "WIDGET PRO 2000"] {
            let ciphertext = enc.encrypt_str(plaintext);
            assert_eq!(enc.decrypt_str(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_disabled_is_identity() {
        let enc = encryptor(false, "");
        let mut records = vec![sale("C1", "WIDGET", "2024-01-01")];
        let before = records.clone();
        enc.encrypt_batch(&mut records);
        assert_eq!(records, before);
    }

    #[test]
    fn test_encrypt_batch_replaces_sensitive_fields_only() {
        let enc = encryptor(true, "k");
        let mut records = vec![sale("C1", "WIDGET", "2024-01-01")];
        enc.encrypt_batch(&mut records);
        assert_ne!(records[0].customer_name, "C1");
        assert_ne!(records[0].product_name, "WIDGET");
        // Ids are not in the allow-list and stay put.
        assert_eq!(records[0].customer_id, "C1");
        assert_eq!(records[0].product_id, "WIDGET");
        assert_eq!(enc.decrypt_str(&records[0].customer_name).unwrap(), "C1");
    }

    #[test]
    fn test_encrypt_enabled_without_key_is_config_error() {
        let err = Encryptor::from_config(&EncryptionConfig {
            encrypt: true,
            key: String::new(),
            fields: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_same_key_same_ciphertext() {
        // The keystream is deterministic, so the composite key of an
        // encrypted field compares identically across runs.
        let a = encryptor(true, "key");
        let b = encryptor(true, "key");
        assert_eq!(a.encrypt_str("C1"), b.encrypt_str("C1"));
    }

    // -------------------------------------------------------------------------
    // DEDUPLICATION FILTER
    // -------------------------------------------------------------------------

    #[test]
    fn test_dedup_against_existing_keys() {
        let existing_row = sale("C1", "WIDGET", "2024-01-01");
        let mut seen: HashSet<CompositeKey> = HashSet::new();
        seen.insert(existing_row.composite_key());

        // The incoming row shares its key with a warehouse row.
        let batch = vec![sale("C1", "WIDGET", "2024-01-01")];
        let (survivors, dropped) = dedup_batch(batch, &mut seen);
        assert_eq!(survivors.len(), 0);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_dedup_within_batch_keeps_first() {
        let mut seen = HashSet::new();
        let mut first = sale("C1", "WIDGET", "2024-01-01");
        first.quantity = 7.0;
        let batch = vec![first, sale("C1", "WIDGET", "2024-01-01")];
        let (survivors, dropped) = dedup_batch(batch, &mut seen);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].quantity, 7.0);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_dedup_distinct_keys_survive() {
        let mut seen = HashSet::new();
        let batch = vec![
            sale("C1", "WIDGET", "2024-01-01"),
            sale("C1", "WIDGET", "2024-01-02"),
            sale("C2", "WIDGET", "2024-01-01"),
        ];
        let (survivors, dropped) = dedup_batch(batch, &mut seen);
        assert_eq!(survivors.len(), 3);
        assert_eq!(dropped, 0);
    }

    // -------------------------------------------------------------------------
    // DIMENSION EXTRACTOR
    // -------------------------------------------------------------------------

    #[test]
    fn test_surrogate_keys_seeded_from_warehouse() {
        let mut customers = HashMap::new();
        customers.insert("C1".to_string(), 4);
        let mut cache = DimensionCache::seed(customers, HashMap::new());

        let out = extract_dimensions(
            &mut cache,
            vec![sale("C1", "WIDGET", "2024-01-01"), sale("C9", "WIDGET", "2024-01-01")],
        );

        // C1 reuses its warehouse key; C9 gets max + 1.
        assert_eq!(out.resolved[0].customer_sk, 4);
        assert_eq!(out.resolved[1].customer_sk, 5);
        assert_eq!(out.new_customers.len(), 1);
        assert_eq!(out.new_customers[0].customer_id, "C9");
    }

    #[test]
    fn test_surrogate_key_stable_across_chunks() {
        let mut cache = DimensionCache::seed(HashMap::new(), HashMap::new());

        let chunk1 = extract_dimensions(&mut cache, vec![sale("C1", "WIDGET", "2024-01-01")]);
        let chunk2 = extract_dimensions(&mut cache, vec![sale("C1", "GADGET", "2024-01-02")]);

        assert_eq!(chunk1.resolved[0].customer_sk, chunk2.resolved[0].customer_sk);
        // The second sighting emits no new customer row.
        assert_eq!(chunk2.new_customers.len(), 0);
        assert_eq!(chunk2.new_products.len(), 1);
    }

    #[test]
    fn test_surrogate_keys_never_collide() {
        let mut cache = DimensionCache::seed(HashMap::new(), HashMap::new());
        let batch: Vec<SaleRecord> = (0..50)
            .map(|i| sale(&format!("C{}", i), "WIDGET", "2024-01-01"))
            .collect();
        let out = extract_dimensions(&mut cache, batch);

        let mut sks: Vec<i64> = out.new_customers.iter().map(|c| c.customer_sk).collect();
        sks.sort_unstable();
        sks.dedup();
        assert_eq!(sks.len(), 50);
    }

    // -------------------------------------------------------------------------
    // FACT ASSEMBLER
    // -------------------------------------------------------------------------

    #[test]
    fn test_facts_reference_resolved_keys() {
        let mut cache = DimensionCache::seed(HashMap::new(), HashMap::new());
        let out = extract_dimensions(
            &mut cache,
            vec![sale("C1", "WIDGET", "2024-01-01"), sale("C2", "GADGET", "2024-01-02")],
        );
        let facts = assemble_facts(&out.resolved);

        assert_eq!(facts.len(), 2);
        for (fact, resolved) in facts.iter().zip(out.resolved.iter()) {
            assert_eq!(fact.customer_sk, resolved.customer_sk);
            assert_eq!(fact.product_sk, resolved.product_sk);
            // Referential integrity: every sk was emitted as a dimension row.
            assert!(out.new_customers.iter().any(|c| c.customer_sk == fact.customer_sk));
            assert!(out.new_products.iter().any(|p| p.product_sk == fact.product_sk));
        }
    }
}
