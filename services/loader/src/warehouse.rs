//! Warehouse access: the capabilities the pipeline needs from the target
//! database, behind a trait so the orchestrator can be exercised without a
//! live Postgres.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{LoadError, Result};
use crate::record::{CompositeKey, CustomerDimensionRow, FactRow, ProductDimensionRow};

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Existing composite keys of the fact table, for seeding the
    /// deduplication filter.
    async fn fact_keys(&self) -> Result<HashSet<CompositeKey>>;

    /// Natural key → surrogate key map of the customer dimension.
    async fn customer_dimension(&self) -> Result<HashMap<String, i64>>;

    /// Natural key → surrogate key map of the product dimension.
    async fn product_dimension(&self) -> Result<HashMap<String, i64>>;

    /// Insert new customer rows; rows whose natural key already exists are
    /// left untouched.
    async fn upsert_customers(&self, rows: &[CustomerDimensionRow]) -> Result<()>;

    /// Insert new product rows; same upsert semantics.
    async fn upsert_products(&self, rows: &[ProductDimensionRow]) -> Result<()>;

    /// Append fact rows. Facts are write-once; their dimension rows must
    /// already be committed when this is called.
    async fn insert_facts(&self, rows: &[FactRow]) -> Result<()>;
}

// =============================================================================
// Postgres implementation
// =============================================================================

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Timeouts and broken connections are worth retrying; everything else
/// (constraint violations, bad SQL, decode errors) aborts the run.
fn classify(e: sqlx::Error) -> LoadError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LoadError::Transient(e.to_string())
        }
        _ => LoadError::Fatal(e.to_string()),
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn fact_keys(&self) -> Result<HashSet<CompositeKey>> {
        let rows: Vec<(String, String, chrono::NaiveDate)> = sqlx::query_as(
            r#"
            SELECT c.customer_id, p.product_id, f.transaction_date
            FROM fact_sales f
            JOIN dim_customer c ON c.customer_sk = f.customer_sk
            JOIN dim_product p ON p.product_sk = f.product_sk
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(customer_id, product_id, transaction_date)| CompositeKey {
                customer_id,
                product_id,
                transaction_date,
            })
            .collect())
    }

    async fn customer_dimension(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT customer_id, customer_sk FROM dim_customer")
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
        Ok(rows.into_iter().collect())
    }

    async fn product_dimension(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT product_id, product_sk FROM dim_product")
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
        Ok(rows.into_iter().collect())
    }

    async fn upsert_customers(&self, rows: &[CustomerDimensionRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO dim_customer (customer_sk, customer_id, customer_name)
                VALUES ($1, $2, $3)
                ON CONFLICT (customer_id) DO NOTHING
                "#,
            )
            .bind(row.customer_sk)
            .bind(&row.customer_id)
            .bind(&row.customer_name)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        }
        Ok(())
    }

    async fn upsert_products(&self, rows: &[ProductDimensionRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO dim_product (product_sk, product_id, product_name)
                VALUES ($1, $2, $3)
                ON CONFLICT (product_id) DO NOTHING
                "#,
            )
            .bind(row.product_sk)
            .bind(&row.product_id)
            .bind(&row.product_name)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        }
        Ok(())
    }

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fact_sales
                (customer_sk, product_sk, quantity, price, transaction_date)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(row.customer_sk)
            .bind(row.product_sk)
            .bind(row.quantity)
            .bind(row.price)
            .bind(row.transaction_date)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        }
        Ok(())
    }
}

// =============================================================================
// In-memory implementation for tests
// =============================================================================

#[cfg(test)]
pub mod mem {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MemState {
        pub customers: Vec<CustomerDimensionRow>,
        pub products: Vec<ProductDimensionRow>,
        pub facts: Vec<FactRow>,
    }

    /// A warehouse backed by vectors, with optional transient-failure
    /// injection for the retry path.
    #[derive(Debug, Default)]
    pub struct MemWarehouse {
        pub state: Mutex<MemState>,
        pub fail_next_writes: Mutex<u32>,
    }

    impl MemWarehouse {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` write calls fail with a transient error.
        pub fn inject_transient_failures(&self, n: u32) {
            *self.fail_next_writes.lock().unwrap() = n;
        }

        fn maybe_fail(&self) -> Result<()> {
            let mut remaining = self.fail_next_writes.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LoadError::Transient("injected write failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Warehouse for MemWarehouse {
        async fn fact_keys(&self) -> Result<HashSet<CompositeKey>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .facts
                .iter()
                .map(|f| CompositeKey {
                    customer_id: f.customer_id.clone(),
                    product_id: f.product_id.clone(),
                    transaction_date: f.transaction_date,
                })
                .collect())
        }

        async fn customer_dimension(&self) -> Result<HashMap<String, i64>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .customers
                .iter()
                .map(|c| (c.customer_id.clone(), c.customer_sk))
                .collect())
        }

        async fn product_dimension(&self) -> Result<HashMap<String, i64>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .products
                .iter()
                .map(|p| (p.product_id.clone(), p.product_sk))
                .collect())
        }

        async fn upsert_customers(&self, rows: &[CustomerDimensionRow]) -> Result<()> {
            self.maybe_fail()?;
            let mut state = self.state.lock().unwrap();
            for row in rows {
                if !state.customers.iter().any(|c| c.customer_id == row.customer_id) {
                    state.customers.push(row.clone());
                }
            }
            Ok(())
        }

        async fn upsert_products(&self, rows: &[ProductDimensionRow]) -> Result<()> {
            self.maybe_fail()?;
            let mut state = self.state.lock().unwrap();
            for row in rows {
                if !state.products.iter().any(|p| p.product_id == row.product_id) {
                    state.products.push(row.clone());
                }
            }
            Ok(())
        }

        async fn insert_facts(&self, rows: &[FactRow]) -> Result<()> {
            self.maybe_fail()?;
            let mut state = self.state.lock().unwrap();
            state.facts.extend(rows.iter().cloned());
            Ok(())
        }
    }
}
