//! Retail/wholesale price models for the two externally priced resources.
//!
//! Both models accumulate observations while the simulation runs: the kWh the
//! external operator sold each hour, and the per-kWh price estimate each trade
//! was settled at. The exact monthly tariffs are computed from these
//! observations after the year completes, and the settlement step reconciles
//! the two.

pub mod electricity;
pub mod heating;

pub use electricity::ElectricityPrice;
pub use heating::HeatingPrice;

use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{HourlySeries, YearMonth};

/// Mutable observation store shared by the price models.
///
/// Written from exactly one place (the primal extractor) while horizons run,
/// read by settlement afterwards.
#[derive(Debug, Clone, Default)]
pub struct PriceObservations {
    /// kWh sold by the external operator, per hour, aggregated over agents.
    all_external_sells: HourlySeries,
    /// Same, broken down per agent (used when the internal market is off and
    /// each agent faces its own tariff).
    external_sells_by_agent: HashMap<String, HourlySeries>,
    /// The estimated retail price each period was settled at.
    price_estimates: HourlySeries,
    price_estimates_by_agent: HashMap<String, HourlySeries>,
}

impl PriceObservations {
    /// Registers an external sell. Zero quantities are recorded too: the
    /// monthly averages need explicit zeros for hours without imports.
    pub fn add_external_sell(&mut self, period: DateTime<Utc>, quantity_kwh: f64) {
        *self.all_external_sells.entry(period).or_insert(0.0) += quantity_kwh;
    }

    pub fn add_external_sell_for_agent(
        &mut self,
        period: DateTime<Utc>,
        quantity_kwh: f64,
        agent_guid: &str,
    ) {
        self.add_external_sell(period, quantity_kwh);
        *self
            .external_sells_by_agent
            .entry(agent_guid.to_string())
            .or_default()
            .entry(period)
            .or_insert(0.0) += quantity_kwh;
    }

    pub fn add_price_estimate(&mut self, period: DateTime<Utc>, price: f64) {
        self.price_estimates.insert(period, price);
    }

    pub fn add_price_estimate_for_agent(
        &mut self,
        period: DateTime<Utc>,
        price: f64,
        agent_guid: &str,
    ) {
        self.add_price_estimate(period, price);
        self.price_estimates_by_agent
            .entry(agent_guid.to_string())
            .or_default()
            .insert(period, price);
    }

    pub fn sells(&self, agent: Option<&str>) -> &HourlySeries {
        static EMPTY: Lazy<HourlySeries> = Lazy::new(HourlySeries::new);
        match agent {
            Some(guid) => self.external_sells_by_agent.get(guid).unwrap_or(&EMPTY),
            None => &self.all_external_sells,
        }
    }

    pub fn price_estimate(&self, period: DateTime<Utc>) -> Option<f64> {
        self.price_estimates.get(&period).copied()
    }

    /// Plain mean of recorded price estimates in a month.
    pub fn mean_estimate_for_month(&self, month: YearMonth) -> Option<f64> {
        let values: Vec<f64> = self
            .price_estimates
            .iter()
            .filter(|(period, _)| YearMonth::of(**period) == month)
            .map(|(_, price)| *price)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Sum of external sells for one calendar month, in kWh.
pub fn consumption_for_month(series: &HourlySeries, month: YearMonth) -> f64 {
    series
        .iter()
        .filter(|(period, _)| YearMonth::of(**period) == month)
        .map(|(_, quantity)| quantity)
        .sum()
}

/// Average hourly power (kW) sold during the January-February preceding
/// `period`. When no such history exists yet, the computation falls back to
/// Jan-Feb data from any year in the register and logs that it did.
pub fn jan_feb_avg_sold(series: &HourlySeries, period: DateTime<Utc>) -> Option<f64> {
    let target_year = if period.month() <= 2 { period.year() - 1 } else { period.year() };
    let in_jan_feb_of = |year: Option<i32>| {
        series
            .iter()
            .filter(move |(p, _)| p.month() <= 2 && year.map(|y| p.year() == y).unwrap_or(true))
            .map(|(_, v)| *v)
            .collect::<Vec<f64>>()
    };
    let mut values = in_jan_feb_of(Some(target_year));
    if values.is_empty() {
        debug!("no Jan-Feb history to base the grid fee on, falling back to future data");
        values = in_jan_feb_of(None);
    }
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// The month's peak day is the calendar day with the highest total sold
/// energy; the result is that day's average hourly power in kW.
pub fn peak_day_avg_kw(series: &HourlySeries, month: YearMonth) -> Option<f64> {
    let mut by_day: HashMap<u32, f64> = HashMap::new();
    for (period, quantity) in series {
        if YearMonth::of(*period) == month {
            *by_day.entry(period.day()).or_insert(0.0) += quantity;
        }
    }
    by_day
        .values()
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
        .map(|max_day_total| max_day_total / 24.0)
}

/// The `n` largest hourly outtakes of a month, descending, zero-padded.
pub fn top_hourly_outtakes(series: &HourlySeries, month: YearMonth, n: usize) -> Vec<f64> {
    let mut values: Vec<f64> = series
        .iter()
        .filter(|(period, _)| YearMonth::of(**period) == month)
        .map(|(_, quantity)| *quantity)
        .collect();
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    values.resize(values.len().max(n), 0.0);
    values.truncate(n);
    values
}
