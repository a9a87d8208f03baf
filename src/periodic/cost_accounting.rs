//! Reserves and records token-usage against monthly budgets, serialized
//! through a single mutex around the underlying store so concurrent
//! handlers never interleave read-modify-write cycles on the same budget.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Abstract monthly-usage ledger; a host application supplies the real
/// persistence behind this.
#[async_trait]
pub trait UsageStore: Send + Sync + std::fmt::Debug {
    async fn get_spent(&self, month_key: &str, category: &str) -> f64;
    async fn record(&self, month_key: &str, category: &str, amount: f64);
}

#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    rows: std::sync::Mutex<HashMap<(String, String), f64>>,
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_spent(&self, month_key: &str, category: &str) -> f64 {
        *self
            .rows
            .lock()
            .unwrap()
            .get(&(month_key.to_string(), category.to_string()))
            .unwrap_or(&0.0)
    }

    async fn record(&self, month_key: &str, category: &str, amount: f64) {
        *self
            .rows
            .lock()
            .unwrap()
            .entry((month_key.to_string(), category.to_string()))
            .or_insert(0.0) += amount;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub spent_after: f64,
}

/// Serializes reservation/recording of token-usage against a monthly
/// budget ceiling per category.
#[derive(Debug)]
pub struct CostAccountant {
    store: Arc<dyn UsageStore>,
    lock: Mutex<()>,
}

impl CostAccountant {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Atomically check-then-reserve `amount` against `category`'s budget
    /// for `month_key`. Returns `allowed=false` without recording anything
    /// if the reservation would exceed `ceiling`.
    pub async fn reserve(&self, month_key: &str, category: &str, amount: f64, ceiling: f64) -> BudgetDecision {
        let _guard = self.lock.lock().await;
        let spent = self.store.get_spent(month_key, category).await;
        let spent_after = spent + amount;
        if spent_after > ceiling {
            return BudgetDecision {
                allowed: false,
                spent_after: spent,
            };
        }
        self.store.record(month_key, category, amount).await;
        BudgetDecision {
            allowed: true,
            spent_after,
        }
    }
}
