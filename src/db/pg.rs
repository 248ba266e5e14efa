#![cfg(feature = "db")]
//! Postgres-backed persistence. Inserts are idempotent via the natural-key
//! unique constraints and `ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::models::*;
use super::Persistence;
use crate::error::PersistenceError;

pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| PersistenceError(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Creates the schema when it does not exist yet.
    pub async fn create_tables(&self) -> Result<(), PersistenceError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS job (
                id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                fail_info TEXT
            )",
            "CREATE TABLE IF NOT EXISTS trade (
                id UUID PRIMARY KEY,
                job_id TEXT NOT NULL,
                period TIMESTAMPTZ NOT NULL,
                agent_guid TEXT NOT NULL,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                quantity_post_loss DOUBLE PRECISION NOT NULL,
                quantity_pre_loss DOUBLE PRECISION NOT NULL,
                price DOUBLE PRECISION,
                by_external BOOLEAN NOT NULL,
                market TEXT NOT NULL,
                loss DOUBLE PRECISION NOT NULL,
                grid_fee_paid DOUBLE PRECISION NOT NULL,
                tax_paid DOUBLE PRECISION NOT NULL,
                UNIQUE (job_id, period, agent_guid, resource, market, action)
            )",
            "CREATE TABLE IF NOT EXISTS level (
                job_id TEXT NOT NULL,
                period TIMESTAMPTZ NOT NULL,
                agent_guid TEXT,
                metadata_key TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                UNIQUE (job_id, period, agent_guid, metadata_key)
            )",
            "CREATE TABLE IF NOT EXISTS electricity_price (
                job_id TEXT NOT NULL,
                period TIMESTAMPTZ NOT NULL,
                exact_retail DOUBLE PRECISION,
                exact_wholesale DOUBLE PRECISION,
                estimated_retail DOUBLE PRECISION,
                estimated_wholesale DOUBLE PRECISION,
                UNIQUE (job_id, period)
            )",
            "CREATE TABLE IF NOT EXISTS heating_price (
                job_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                exact_retail DOUBLE PRECISION,
                exact_wholesale DOUBLE PRECISION,
                estimated_retail DOUBLE PRECISION,
                estimated_wholesale DOUBLE PRECISION,
                UNIQUE (job_id, year, month)
            )",
            "CREATE TABLE IF NOT EXISTS extra_cost (
                job_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                agent_guid TEXT NOT NULL,
                cost_type TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                UNIQUE (job_id, year, month, agent_guid, cost_type)
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError(e.to_string()))?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError(e.to_string())
}

#[async_trait]
impl Persistence for PgStore {
    async fn create_job(&self, job: JobRow) -> Result<(), PersistenceError> {
        sqlx::query("INSERT INTO job (id, config_id) VALUES ($1, $2)")
            .bind(&job.id)
            .bind(&job.config_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_job_started(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE job SET start_time = $2 WHERE id = $1")
            .bind(job_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_job_finished(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE job SET end_time = $2 WHERE id = $1")
            .bind(job_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_job_failed(
        &self,
        job_id: &str,
        fail_info: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE job SET fail_info = $2 WHERE id = $1")
            .bind(job_id)
            .bind(fail_info)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_trades(&self, rows: Vec<TradeRow>) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO trade (id, job_id, period, agent_guid, action, resource, \
                 quantity_post_loss, quantity_pre_loss, price, by_external, market, loss, \
                 grid_fee_paid, tax_paid) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                 ON CONFLICT (job_id, period, agent_guid, resource, market, action) DO NOTHING",
            )
            .bind(row.id)
            .bind(&row.job_id)
            .bind(row.period)
            .bind(&row.agent_guid)
            .bind(&row.action)
            .bind(&row.resource)
            .bind(row.quantity_post_loss)
            .bind(row.quantity_pre_loss)
            .bind(row.price)
            .bind(row.by_external)
            .bind(&row.market)
            .bind(row.loss)
            .bind(row.grid_fee_paid)
            .bind(row.tax_paid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn insert_levels(&self, rows: Vec<LevelRow>) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO level (job_id, period, agent_guid, metadata_key, value) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id, period, agent_guid, metadata_key) DO NOTHING",
            )
            .bind(&row.job_id)
            .bind(row.period)
            .bind(&row.agent_guid)
            .bind(&row.metadata_key)
            .bind(row.value)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn insert_electricity_prices(
        &self,
        rows: Vec<ElectricityPriceRow>,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO electricity_price (job_id, period, exact_retail, exact_wholesale, \
                 estimated_retail, estimated_wholesale) VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (job_id, period) DO NOTHING",
            )
            .bind(&row.job_id)
            .bind(row.period)
            .bind(row.exact_retail)
            .bind(row.exact_wholesale)
            .bind(row.estimated_retail)
            .bind(row.estimated_wholesale)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn insert_heating_prices(
        &self,
        rows: Vec<HeatingPriceRow>,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO heating_price (job_id, year, month, exact_retail, exact_wholesale, \
                 estimated_retail, estimated_wholesale) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (job_id, year, month) DO NOTHING",
            )
            .bind(&row.job_id)
            .bind(row.year)
            .bind(row.month as i32)
            .bind(row.exact_retail)
            .bind(row.exact_wholesale)
            .bind(row.estimated_retail)
            .bind(row.estimated_wholesale)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn insert_extra_costs(&self, rows: Vec<ExtraCostRow>) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO extra_cost (job_id, year, month, agent_guid, cost_type, amount) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (job_id, year, month, agent_guid, cost_type) DO NOTHING",
            )
            .bind(&row.job_id)
            .bind(row.year)
            .bind(row.month as i32)
            .bind(&row.agent_guid)
            .bind(&row.cost_type)
            .bind(row.amount)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), PersistenceError> {
        self.delete_job_data(job_id).await?;
        sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_job_data(&self, job_id: &str) -> Result<(), PersistenceError> {
        let statements = [
            "DELETE FROM trade WHERE job_id = $1",
            "DELETE FROM level WHERE job_id = $1",
            "DELETE FROM electricity_price WHERE job_id = $1",
            "DELETE FROM heating_price WHERE job_id = $1",
            "DELETE FROM extra_cost WHERE job_id = $1",
        ];
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for statement in statements {
            sqlx::query(statement)
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}
