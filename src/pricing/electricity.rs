//! Electricity tariff model.
//!
//! Retail price on top of the Nordpool spot: a transmission fee and tax per
//! kWh, plus a monthly effect fee charged on the average of the month's three
//! highest hourly outtakes. The effect fee enters the optimiser's objective
//! as a peak variable; its per-kWh share is reconstructed by the primal
//! extractor and reconciled against the realised peaks by settlement.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{consumption_for_month, top_hourly_outtakes, PriceObservations};
use crate::domain::{HourlySeries, YearMonth};
use crate::error::ConfigError;

/// Tariff parameters for trades that clear inside the community. The members
/// recognise a reduced tax and grid fee on internally sourced energy.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalTariff {
    pub tax: f64,
    pub grid_fee: f64,
}

#[derive(Debug, Clone)]
pub struct ElectricityPrice {
    nordpool: HourlySeries,
    pub tax: f64,
    pub transmission_fee: f64,
    pub internal: InternalTariff,
    /// Added to the spot price to form the price the utility buys at.
    pub wholesale_offset: f64,
    /// SEK per kW of top-3 average peak, per month.
    pub effect_fee: f64,
    pub observations: PriceObservations,
}

impl ElectricityPrice {
    pub fn new(
        nordpool: HourlySeries,
        tax: f64,
        transmission_fee: f64,
        internal: InternalTariff,
        wholesale_offset: f64,
        effect_fee: f64,
    ) -> Self {
        Self {
            nordpool,
            tax,
            transmission_fee,
            internal,
            wholesale_offset,
            effect_fee,
            observations: PriceObservations::default(),
        }
    }

    pub fn nordpool_price(&self, period: DateTime<Utc>) -> Result<f64, ConfigError> {
        self.nordpool.get(&period).copied().ok_or_else(|| ConfigError::InvalidValue {
            field: "nordpool".into(),
            reason: format!("no spot price for {period}"),
        })
    }

    /// Spot prices for `horizon` consecutive hours starting at `start`.
    pub fn nordpool_prices_for_horizon(
        &self,
        start: DateTime<Utc>,
        horizon: usize,
    ) -> Result<Vec<f64>, ConfigError> {
        crate::domain::hourly_range(start, horizon)
            .into_iter()
            .map(|period| self.nordpool_price(period))
            .collect()
    }

    /// The per-kWh price the optimiser sees for external buys, excluding the
    /// peak-dependent effect fee.
    pub fn estimated_retail_excl_effect_fee(&self, period: DateTime<Utc>) -> Result<f64, ConfigError> {
        Ok(self.nordpool_price(period)? + self.transmission_fee + self.tax)
    }

    pub fn estimated_wholesale_price(&self, period: DateTime<Utc>) -> Result<f64, ConfigError> {
        Ok(self.nordpool_price(period)? + self.wholesale_offset)
    }

    /// The monthly effect fee expressed per day, as the optimiser's
    /// objective sees it.
    pub fn effect_fee_per_day(&self, period: DateTime<Utc>) -> f64 {
        self.effect_fee / YearMonth::of(period).days_in_month() as f64
    }

    /// The three highest hourly outtakes recorded so far in `period`'s month,
    /// descending, zero-padded.
    pub fn top_three_hourly_outtakes(&self, period: DateTime<Utc>, agent: Option<&str>) -> [f64; 3] {
        let top = top_hourly_outtakes(self.observations.sells(agent), YearMonth::of(period), 3);
        [top[0], top[1], top[2]]
    }

    /// Realised per-kWh effect-fee share of a finished month: the monthly
    /// effect fee on the top-3 average peak, spread over the month's kWh.
    /// `None` when nothing was consumed.
    pub fn exact_effect_fee_per_kwh(&self, month: YearMonth, agent: Option<&str>) -> Option<f64> {
        let sells = self.observations.sells(agent);
        let consumption = consumption_for_month(sells, month);
        if consumption == 0.0 {
            debug!(%month, "no electricity consumption this month, effect fee share undefined");
            return None;
        }
        let top3 = top_hourly_outtakes(sells, month, 3);
        let avg_peak = top3.iter().sum::<f64>() / 3.0;
        Some(self.effect_fee * avg_peak / consumption)
    }

    /// Exact retail price for one period, computable once its month is over.
    pub fn exact_retail_price(
        &self,
        period: DateTime<Utc>,
        agent: Option<&str>,
    ) -> Result<Option<f64>, ConfigError> {
        let base = self.estimated_retail_excl_effect_fee(period)?;
        Ok(self
            .exact_effect_fee_per_kwh(YearMonth::of(period), agent)
            .map(|share| base + share))
    }

    /// The exact wholesale price carries no peak component.
    pub fn exact_wholesale_price(&self, period: DateTime<Utc>) -> Result<f64, ConfigError> {
        self.estimated_wholesale_price(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 3, day, hour, 0, 0).unwrap()
    }

    fn pricing_with_flat_spot(spot: f64) -> ElectricityPrice {
        let mut nordpool = HourlySeries::new();
        for day in 1..=31 {
            for h in 0..24 {
                nordpool.insert(hour(day, h), spot);
            }
        }
        ElectricityPrice::new(
            nordpool,
            0.392,
            0.148,
            InternalTariff { tax: 0.0, grid_fee: 0.0 },
            0.05,
            35.0,
        )
    }

    #[test]
    fn test_estimated_prices() {
        let pricing = pricing_with_flat_spot(1.0);
        let period = hour(1, 0);
        let retail = pricing.estimated_retail_excl_effect_fee(period).unwrap();
        let wholesale = pricing.estimated_wholesale_price(period).unwrap();
        assert!((retail - 1.54).abs() < 1e-9);
        assert!((wholesale - 1.05).abs() < 1e-9);
        assert!(retail >= wholesale);
    }

    #[test]
    fn test_missing_spot_price_is_an_error() {
        let pricing = pricing_with_flat_spot(1.0);
        let outside = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(pricing.nordpool_price(outside).is_err());
    }

    #[test]
    fn test_exact_effect_fee_per_kwh() {
        let mut pricing = pricing_with_flat_spot(1.0);
        pricing.observations.add_external_sell(hour(1, 0), 30.0);
        pricing.observations.add_external_sell(hour(1, 1), 60.0);
        pricing.observations.add_external_sell(hour(2, 0), 90.0);
        pricing.observations.add_external_sell(hour(2, 1), 20.0);
        // top3 = 90, 60, 30 -> avg 60 kW; consumption 200 kWh
        let share = pricing
            .exact_effect_fee_per_kwh(YearMonth::new(2019, 3), None)
            .unwrap();
        assert!((share - 35.0 * 60.0 / 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_retail_none_without_consumption() {
        let pricing = pricing_with_flat_spot(1.0);
        assert_eq!(pricing.exact_retail_price(hour(1, 0), None).unwrap(), None);
    }

    #[test]
    fn test_top_three_padding() {
        let mut pricing = pricing_with_flat_spot(1.0);
        pricing.observations.add_external_sell(hour(1, 0), 12.0);
        let top3 = pricing.top_three_hourly_outtakes(hour(15, 0), None);
        assert_eq!(top3, [12.0, 0.0, 0.0]);
    }
}
