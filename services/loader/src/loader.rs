//! Orchestrator: streams the source file in chunks and drives each chunk
//! through normalize → validate → encrypt → dedup → dimensions → facts,
//! committing dimension upserts before fact inserts.
//!
//! Chunks are processed sequentially in file order; the surrogate-key
//! cache and the composite-key set require a single monotonically
//! advancing owner. There is no cross-chunk transaction: a fatal error
//! stops further chunks but leaves committed ones committed.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{LoadError, Result};
use crate::pipeline::{
    assemble_facts, dedup_batch, extract_dimensions, normalize_batch, validate_batch,
    DimensionCache, Encryptor,
};
use crate::record::{CompositeKey, Schema};
use crate::warehouse::Warehouse;

const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Running counters for one load, reported at end of run no matter how
/// the run ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub rows_repaired: usize,
    pub rows_deduplicated: usize,
    pub customers_added: usize,
    pub products_added: usize,
    pub facts_inserted: usize,
    pub chunks_committed: usize,
}

impl RunStats {
    pub fn log_summary(&self) {
        info!("=== Load Summary ===");
        info!("Rows read:         {}", self.rows_read);
        info!("Rows rejected:     {}", self.rows_rejected);
        info!("Rows repaired:     {}", self.rows_repaired);
        info!("Rows deduplicated: {}", self.rows_deduplicated);
        info!("Customers added:   {}", self.customers_added);
        info!("Products added:    {}", self.products_added);
        info!("Facts inserted:    {}", self.facts_inserted);
        info!("Chunks committed:  {}", self.chunks_committed);
    }
}

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Run a warehouse operation, retrying transient failures a bounded number
/// of times with doubling backoff. Exhausted retries escalate to fatal.
async fn with_retry<'a, T>(
    label: &str,
    mut op: impl FnMut() -> OpFuture<'a, T>,
) -> Result<T> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_WRITE_ATTEMPTS => {
                warn!(attempt, "{} failed transiently: {}; retrying in {:?}", label, e, delay);
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(LoadError::Fatal(format!(
                    "{} failed after {} attempts: {}",
                    label, attempt, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Process one chunk end to end and commit it.
async fn process_chunk(
    config: &Config,
    schema: &Schema,
    encryptor: &Encryptor,
    warehouse: &dyn Warehouse,
    dry_run: bool,
    seen_keys: &mut HashSet<CompositeKey>,
    cache: &mut DimensionCache,
    stats: &mut RunStats,
    rows: Vec<(usize, Vec<String>)>,
) -> Result<()> {
    let first_line = rows.first().map(|(line, _)| *line).unwrap_or(0);
    let chunk_len = rows.len();

    let normalized = normalize_batch(rows);
    let outcome = validate_batch(schema, &config.validation, &normalized);
    stats.rows_rejected += outcome.rejected;
    stats.rows_repaired += outcome.repaired;

    if outcome.rejected > 0 && config.validation.abort_on_invalid {
        return Err(LoadError::Fatal(format!(
            "chunk starting at line {}: {} invalid rows, aborting per configuration",
            first_line, outcome.rejected
        )));
    }

    let mut records = outcome.records;
    encryptor.encrypt_batch(&mut records);

    let (survivors, deduped) = dedup_batch(records, seen_keys);
    stats.rows_deduplicated += deduped;

    let dims = extract_dimensions(cache, survivors);
    let facts = assemble_facts(&dims.resolved);

    if !dry_run {
        if !dims.new_customers.is_empty() {
            with_retry("customer dimension upsert", || {
                Box::pin(warehouse.upsert_customers(&dims.new_customers))
            })
            .await?;
        }
        if !dims.new_products.is_empty() {
            with_retry("product dimension upsert", || {
                Box::pin(warehouse.upsert_products(&dims.new_products))
            })
            .await?;
        }
        if !facts.is_empty() {
            with_retry("fact insert", || Box::pin(warehouse.insert_facts(&facts))).await?;
        }
    }

    stats.customers_added += dims.new_customers.len();
    stats.products_added += dims.new_products.len();
    stats.facts_inserted += facts.len();
    stats.chunks_committed += 1;

    info!(
        chunk = stats.chunks_committed,
        rows = chunk_len,
        rejected = outcome.rejected,
        deduplicated = deduped,
        facts = facts.len(),
        "chunk committed"
    );
    Ok(())
}

/// Drive the whole load: seed the dedup and dimension caches from the
/// warehouse, then stream the source file in `chunksize` batches.
pub async fn run(
    config: &Config,
    warehouse: &dyn Warehouse,
    dry_run: bool,
    stats: &mut RunStats,
) -> Result<()> {
    let encryptor = Encryptor::from_config(&config.encryption)?;

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(&config.file.path)
        .map_err(|e| {
            LoadError::Config(format!("cannot open source file '{}': {}", config.file.path, e))
        })?;

    let headers = reader
        .headers()
        .map_err(|e| LoadError::Fatal(format!("cannot read header row: {}", e)))?
        .clone();
    let schema = Schema::from_headers(headers.iter())?;
    info!(fields = ?schema.fields, "schema resolved from header row");

    let mut seen_keys = with_retry("composite key seed", || Box::pin(warehouse.fact_keys())).await?;
    let customers =
        with_retry("customer dimension seed", || Box::pin(warehouse.customer_dimension())).await?;
    let products =
        with_retry("product dimension seed", || Box::pin(warehouse.product_dimension())).await?;
    info!(
        existing_facts = seen_keys.len(),
        existing_customers = customers.len(),
        existing_products = products.len(),
        "warehouse caches seeded"
    );
    let mut cache = DimensionCache::seed(customers, products);

    let mut chunk: Vec<(usize, Vec<String>)> = Vec::with_capacity(config.file.chunksize);
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2; // 1-indexed, header is line 1
        match result {
            Ok(record) => {
                stats.rows_read += 1;
                chunk.push((line, record.iter().map(|f| f.to_string()).collect()));
            }
            Err(e) => {
                // A malformed line is a row-level problem, not a run-level one.
                warn!(line, "rejected: unreadable row: {}", e);
                stats.rows_read += 1;
                stats.rows_rejected += 1;
            }
        }

        if chunk.len() >= config.file.chunksize {
            let rows = std::mem::take(&mut chunk);
            process_chunk(
                config, &schema, &encryptor, warehouse, dry_run, &mut seen_keys, &mut cache,
                stats, rows,
            )
            .await?;
        }
    }

    if !chunk.is_empty() {
        process_chunk(
            config, &schema, &encryptor, warehouse, dry_run, &mut seen_keys, &mut cache, stats,
            chunk,
        )
        .await?;
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
