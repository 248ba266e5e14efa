//! Row types for the persistence sink, keyed by `job_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ExtraCost, Trade, TradeMetadataKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub config_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub fail_info: Option<String>,
}

impl JobRow {
    pub fn new(id: &str, config_id: &str) -> Self {
        Self {
            id: id.to_string(),
            config_id: config_id.to_string(),
            start_time: None,
            end_time: None,
            fail_info: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: Uuid,
    pub job_id: String,
    pub period: DateTime<Utc>,
    pub agent_guid: String,
    pub action: String,
    pub resource: String,
    pub quantity_post_loss: f64,
    pub quantity_pre_loss: f64,
    pub price: Option<f64>,
    pub by_external: bool,
    pub market: String,
    pub loss: f64,
    pub grid_fee_paid: f64,
    pub tax_paid: f64,
}

impl TradeRow {
    pub fn from_trade(job_id: &str, trade: &Trade) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            period: trade.period,
            agent_guid: trade.agent_guid.clone(),
            action: trade.action.to_string(),
            resource: trade.resource.to_string(),
            quantity_post_loss: trade.quantity_post_loss,
            quantity_pre_loss: trade.quantity_pre_loss,
            price: trade.price,
            by_external: trade.by_external,
            market: trade.market.to_string(),
            loss: trade.loss,
            grid_fee_paid: trade.grid_fee_paid,
            tax_paid: trade.tax_paid,
        }
    }
}

/// One point of a metadata level series. `agent_guid` is empty for
/// community-wide series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelRow {
    pub job_id: String,
    pub period: DateTime<Utc>,
    pub agent_guid: Option<String>,
    pub metadata_key: String,
    pub value: f64,
}

impl LevelRow {
    pub fn new(
        job_id: &str,
        period: DateTime<Utc>,
        agent_guid: Option<&str>,
        key: TradeMetadataKey,
        value: f64,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            period,
            agent_guid: agent_guid.map(str::to_string),
            metadata_key: key.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectricityPriceRow {
    pub job_id: String,
    pub period: DateTime<Utc>,
    pub exact_retail: Option<f64>,
    pub exact_wholesale: Option<f64>,
    pub estimated_retail: Option<f64>,
    pub estimated_wholesale: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingPriceRow {
    pub job_id: String,
    pub year: i32,
    pub month: u32,
    pub exact_retail: Option<f64>,
    pub exact_wholesale: Option<f64>,
    pub estimated_retail: Option<f64>,
    pub estimated_wholesale: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraCostRow {
    pub job_id: String,
    pub year: i32,
    pub month: u32,
    pub agent_guid: String,
    pub cost_type: String,
    pub amount: f64,
}

impl ExtraCostRow {
    pub fn from_extra_cost(job_id: &str, cost: &ExtraCost) -> Self {
        Self {
            job_id: job_id.to_string(),
            year: cost.month.year,
            month: cost.month.month,
            agent_guid: cost.agent_guid.clone(),
            cost_type: cost.cost_type.to_string(),
            amount: cost.amount,
        }
    }
}
