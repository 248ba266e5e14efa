//! Persistence: a bulk row sink keyed by `job_id`, with idempotent inserts.
//!
//! The driver writes through the [`Persistence`] trait. The in-memory store
//! backs tests and dry runs; the Postgres implementation lives behind the
//! `db` feature.

pub mod models;
#[cfg(feature = "db")]
pub mod pg;

pub use models::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::PersistenceError;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_job(&self, job: JobRow) -> Result<(), PersistenceError>;
    async fn update_job_started(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;
    async fn update_job_finished(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;
    async fn update_job_failed(
        &self,
        job_id: &str,
        fail_info: &str,
    ) -> Result<(), PersistenceError>;

    async fn insert_trades(&self, rows: Vec<TradeRow>) -> Result<(), PersistenceError>;
    async fn insert_levels(&self, rows: Vec<LevelRow>) -> Result<(), PersistenceError>;
    async fn insert_electricity_prices(
        &self,
        rows: Vec<ElectricityPriceRow>,
    ) -> Result<(), PersistenceError>;
    async fn insert_heating_prices(
        &self,
        rows: Vec<HeatingPriceRow>,
    ) -> Result<(), PersistenceError>;
    async fn insert_extra_costs(&self, rows: Vec<ExtraCostRow>) -> Result<(), PersistenceError>;

    /// Removes the job row and every row associated with the job.
    async fn delete_job(&self, job_id: &str) -> Result<(), PersistenceError>;

    /// Removes the job's data rows but keeps the job row itself, so the
    /// failure info stays inspectable.
    async fn delete_job_data(&self, job_id: &str) -> Result<(), PersistenceError>;
}

/// In-memory store. Inserts are idempotent on the natural key of each row
/// kind, mirroring the unique constraints of the relational schema.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, JobRow>,
    // Keyed by (job, period, agent, resource, market, action)
    trades: HashMap<(String, DateTime<Utc>, String, String, String, String), TradeRow>,
    levels: HashMap<(String, DateTime<Utc>, Option<String>, String), LevelRow>,
    electricity_prices: HashMap<(String, DateTime<Utc>), ElectricityPriceRow>,
    heating_prices: HashMap<(String, i32, u32), HeatingPriceRow>,
    extra_costs: HashMap<(String, i32, u32, String, String), ExtraCostRow>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, job_id: &str) -> Option<JobRow> {
        self.inner.read().jobs.get(job_id).cloned()
    }

    pub fn trades_for_job(&self, job_id: &str) -> Vec<TradeRow> {
        let mut rows: Vec<TradeRow> = self
            .inner
            .read()
            .trades
            .values()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.period, row.agent_guid.clone(), row.resource.clone()));
        rows
    }

    pub fn levels_for_job(&self, job_id: &str) -> Vec<LevelRow> {
        self.inner
            .read()
            .levels
            .values()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn electricity_prices_for_job(&self, job_id: &str) -> Vec<ElectricityPriceRow> {
        self.inner
            .read()
            .electricity_prices
            .values()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn heating_prices_for_job(&self, job_id: &str) -> Vec<HeatingPriceRow> {
        self.inner
            .read()
            .heating_prices
            .values()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn extra_costs_for_job(&self, job_id: &str) -> Vec<ExtraCostRow> {
        self.inner
            .read()
            .extra_costs
            .values()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn create_job(&self, job: JobRow) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        if inner.jobs.contains_key(&job.id) {
            return Err(PersistenceError(format!("job '{}' already exists", job.id)));
        }
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_job_started(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PersistenceError(format!("unknown job '{job_id}'")))?;
        job.start_time = Some(at);
        Ok(())
    }

    async fn update_job_finished(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PersistenceError(format!("unknown job '{job_id}'")))?;
        job.end_time = Some(at);
        Ok(())
    }

    async fn update_job_failed(
        &self,
        job_id: &str,
        fail_info: &str,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PersistenceError(format!("unknown job '{job_id}'")))?;
        job.fail_info = Some(fail_info.to_string());
        Ok(())
    }

    async fn insert_trades(&self, rows: Vec<TradeRow>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        for row in rows {
            let key = (
                row.job_id.clone(),
                row.period,
                row.agent_guid.clone(),
                row.resource.clone(),
                row.market.clone(),
                row.action.clone(),
            );
            inner.trades.insert(key, row);
        }
        Ok(())
    }

    async fn insert_levels(&self, rows: Vec<LevelRow>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        for row in rows {
            let key = (
                row.job_id.clone(),
                row.period,
                row.agent_guid.clone(),
                row.metadata_key.clone(),
            );
            inner.levels.insert(key, row);
        }
        Ok(())
    }

    async fn insert_electricity_prices(
        &self,
        rows: Vec<ElectricityPriceRow>,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        for row in rows {
            inner.electricity_prices.insert((row.job_id.clone(), row.period), row);
        }
        Ok(())
    }

    async fn insert_heating_prices(
        &self,
        rows: Vec<HeatingPriceRow>,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        for row in rows {
            inner.heating_prices.insert((row.job_id.clone(), row.year, row.month), row);
        }
        Ok(())
    }

    async fn insert_extra_costs(&self, rows: Vec<ExtraCostRow>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        for row in rows {
            let key = (
                row.job_id.clone(),
                row.year,
                row.month,
                row.agent_guid.clone(),
                row.cost_type.clone(),
            );
            inner.extra_costs.insert(key, row);
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), PersistenceError> {
        self.inner.write().jobs.remove(job_id);
        self.delete_job_data(job_id).await
    }

    async fn delete_job_data(&self, job_id: &str) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write();
        inner.trades.retain(|key, _| key.0 != job_id);
        inner.levels.retain(|key, _| key.0 != job_id);
        inner.electricity_prices.retain(|key, _| key.0 != job_id);
        inner.heating_prices.retain(|key, _| key.0 != job_id);
        inner.extra_costs.retain(|key, _| key.0 != job_id);
        Ok(())
    }
}
