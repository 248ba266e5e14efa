//! District heating tariff model.
//!
//! The utility's bill for a month has three components: a base energy price
//! (cheaper in summer), a yearly grid fee set by the average hourly outtake
//! during January-February and spread over the months, and an effect fee
//! charged on the average hourly outtake of the month's peak day.

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use super::{
    consumption_for_month, jan_feb_avg_sold, peak_day_avg_kw, PriceObservations,
};
use crate::domain::{is_leap_year, YearMonth};

// Yearly grid fee schedule: fixed + marginal SEK per kW of Jan-Feb average
// outtake, in five brackets.
const GRID_FEE_MARGINAL_SUB_50: f64 = 1116.0;
const GRID_FEE_FIXED_SUB_50: f64 = 1152.0;
const GRID_FEE_MARGINAL_50_100: f64 = 1068.0;
const GRID_FEE_FIXED_50_100: f64 = 3060.0;
const GRID_FEE_MARGINAL_100_200: f64 = 1020.0;
const GRID_FEE_FIXED_100_200: f64 = 8148.0;
const GRID_FEE_MARGINAL_200_400: f64 = 972.0;
const GRID_FEE_FIXED_200_400: f64 = 18348.0;
const GRID_FEE_MARGINAL_400_PLUS: f64 = 936.0;
const GRID_FEE_FIXED_400_PLUS: f64 = 33696.0;

const MARGINAL_PRICE_WINTER: f64 = 0.5;
const MARGINAL_PRICE_SUMMER: f64 = 0.3;

pub const DEFAULT_EFFECT_FEE: f64 = 68.0;

/// Exact and estimated pricing of district heating, plus the observation
/// register that the exact monthly tariff is computed from.
#[derive(Debug, Clone)]
pub struct HeatingPrice {
    /// Fraction of the retail price the utility pays when buying back heat.
    pub wholesale_price_fraction: f64,
    /// SEK per kW of peak-day average outtake, per month.
    pub effect_fee: f64,
    pub observations: PriceObservations,
}

impl HeatingPrice {
    pub fn new(wholesale_price_fraction: f64, effect_fee: f64) -> Self {
        Self { wholesale_price_fraction, effect_fee, observations: PriceObservations::default() }
    }

    /// 'Summer price' during May-September, 'winter price' otherwise.
    pub fn base_marginal_price(&self, month: u32) -> f64 {
        if (5..=9).contains(&month) {
            MARGINAL_PRICE_SUMMER
        } else {
            MARGINAL_PRICE_WINTER
        }
    }

    /// Marginal grid fee of one extra kWh sold during January-February,
    /// assuming the community lands in the top consumption bracket.
    pub fn marginal_grid_fee_assuming_top_bracket(&self, year: i32) -> f64 {
        let hours_in_jan_feb = 1416.0 + if is_leap_year(year) { 24.0 } else { 0.0 };
        GRID_FEE_MARGINAL_400_PLUS / hours_in_jan_feb
    }

    /// The price the external operator is believed to sell at, excluding the
    /// peak-dependent effect fee (which the optimiser prices separately).
    /// District heating is not taxed.
    pub fn retail_price_excl_effect_fee(&self, period: DateTime<Utc>) -> f64 {
        let base = self.base_marginal_price(period.month());
        if period.month() <= 2 {
            base + self.marginal_grid_fee_assuming_top_bracket(period.year())
        } else {
            base
        }
    }

    /// Effect fee for a month, given the average hourly outtake of the
    /// month's peak day.
    pub fn exact_effect_fee(&self, peak_day_avg_kw: f64) -> f64 {
        self.effect_fee * peak_day_avg_kw
    }

    /// The effect fee expressed per day, as the optimiser's objective sees it.
    pub fn effect_fee_per_day(&self, period: DateTime<Utc>) -> f64 {
        self.effect_fee / YearMonth::of(period).days_in_month() as f64
    }

    /// Yearly grid fee from the five-bracket schedule.
    pub fn yearly_grid_fee(&self, jan_feb_hourly_avg_kw: f64) -> f64 {
        let (fixed, marginal) = if jan_feb_hourly_avg_kw < 50.0 {
            (GRID_FEE_FIXED_SUB_50, GRID_FEE_MARGINAL_SUB_50)
        } else if jan_feb_hourly_avg_kw < 100.0 {
            (GRID_FEE_FIXED_50_100, GRID_FEE_MARGINAL_50_100)
        } else if jan_feb_hourly_avg_kw < 200.0 {
            (GRID_FEE_FIXED_100_200, GRID_FEE_MARGINAL_100_200)
        } else if jan_feb_hourly_avg_kw < 400.0 {
            (GRID_FEE_FIXED_200_400, GRID_FEE_MARGINAL_200_400)
        } else {
            (GRID_FEE_FIXED_400_PLUS, GRID_FEE_MARGINAL_400_PLUS)
        };
        fixed + marginal * jan_feb_hourly_avg_kw
    }

    /// The yearly grid fee spread over one month, proportional to the number
    /// of days.
    pub fn grid_fee_for_month(&self, jan_feb_hourly_avg_kw: f64, month: YearMonth) -> f64 {
        let fraction_of_year = month.days_in_month() as f64 / month.days_in_year() as f64;
        self.yearly_grid_fee(jan_feb_hourly_avg_kw) * fraction_of_year
    }

    /// Total SEK billed by the utility for one month.
    pub fn exact_price_for_month_total(
        &self,
        month: YearMonth,
        consumption_kwh: f64,
        jan_feb_avg_kw: f64,
        peak_day_avg_kw: f64,
    ) -> f64 {
        let effect_fee = self.exact_effect_fee(peak_day_avg_kw);
        let grid_fee = self.grid_fee_for_month(jan_feb_avg_kw, month);
        let base = self.base_marginal_price(month.month);
        base * consumption_kwh + effect_fee + grid_fee
    }

    /// Exact per-kWh retail price of a finished month, from the accumulated
    /// external sells. `None` when nothing was consumed that month.
    pub fn exact_retail_price(&self, month: YearMonth, agent: Option<&str>) -> Option<f64> {
        let sells = self.observations.sells(agent);
        let consumption = consumption_for_month(sells, month);
        if consumption == 0.0 {
            debug!(%month, "no heating consumption this month, exact price undefined");
            return None;
        }
        let jan_feb_avg = jan_feb_avg_sold(sells, month.first_hour()).unwrap_or(0.0);
        let peak_day_avg = peak_day_avg_kw(sells, month).unwrap_or(0.0);
        let total = self.exact_price_for_month_total(month, consumption, jan_feb_avg, peak_day_avg);
        Some(total / consumption)
    }

    /// Exact per-kWh price the utility would buy at.
    pub fn exact_wholesale_price(&self, month: YearMonth, agent: Option<&str>) -> Option<f64> {
        self.exact_retail_price(month, agent)
            .map(|retail| retail * self.wholesale_price_fraction)
    }

    /// Average outtake of the month's peak day so far, used by the optimiser
    /// as the already-committed effect-fee level. Early in a month the
    /// previous month's value, scaled down, acts as a floor so the estimate
    /// is not anchored on one or two quiet days.
    pub fn avg_peak_for_month(&self, period: DateTime<Utc>, agent: Option<&str>) -> f64 {
        let sells = self.observations.sells(agent);
        let this_month = peak_day_avg_kw(sells, YearMonth::of(period));
        let at_least_n_days = 5;
        let avg_peak = if period.day() < at_least_n_days {
            let scale_factor_for_last_month = 0.8;
            let prev = period - chrono::Duration::days(at_least_n_days as i64 + 1);
            let last_month = peak_day_avg_kw(sells, YearMonth::of(prev));
            match (this_month, last_month) {
                (Some(this), Some(last)) => Some(this.max(last * scale_factor_for_last_month)),
                (Some(this), None) => Some(this),
                (None, _) => None,
            }
        } else {
            this_month
        };
        avg_peak.unwrap_or(0.0)
    }
}

impl Default for HeatingPrice {
    fn default() -> Self {
        Self::new(0.0, DEFAULT_EFFECT_FEE)
    }
}
