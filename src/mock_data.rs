//! Deterministic mock demand and input-data synthesis.
//!
//! The simulation treats this as a read-only data source. Everything is
//! derived from a seed hashed out of the agent set and the mock-data
//! constants, so an unchanged configuration reproduces its series bit for
//! bit across runs.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::f64::consts::PI;
use xxhash_rust::xxh64::xxh64;

use crate::config::{AgentSpec, MockDataConstants};
use crate::domain::HourlySeries;

pub const HOURS_PER_YEAR: f64 = 8766.0;

/// Hourly consumption series for one building, kWh.
#[derive(Debug, Clone, Default)]
pub struct AgentMockSeries {
    pub elec_cons: HourlySeries,
    pub space_heat_cons: HourlySeries,
    pub hot_water_cons: HourlySeries,
    pub cooling_cons: HourlySeries,
    /// Excess heat offered to the community, nonzero only for agents that
    /// sell it (grocery stores with heat recovery).
    pub excess_heat_prod: HourlySeries,
}

/// Exogenous hourly inputs shared by all agents.
#[derive(Debug, Clone, Default)]
pub struct InputSeries {
    /// Solar irradiation, W/m2.
    pub irradiation: HourlySeries,
    /// Outdoor temperature, degrees Celsius.
    pub temperature: HourlySeries,
    /// Nordpool spot price, SEK/kWh.
    pub nordpool_price: HourlySeries,
}

/// Seed identifying a mock-data set: equal agent sets plus equal constants
/// hash to the same seed and therefore to identical draws.
pub fn mock_data_seed(agents: &[AgentSpec], constants: &MockDataConstants) -> u64 {
    let mut identity: Vec<(String, String, String)> = agents
        .iter()
        .map(|agent| {
            (agent.name.clone(), agent.agent_type.clone(), format!("{:.3}", agent.gross_floor_area))
        })
        .collect();
    identity.sort();
    let payload = serde_json::to_string(&(identity, constants)).unwrap_or_default();
    xxh64(payload.as_bytes(), 0)
}

/// Generates the consumption series for every building agent in the
/// configuration. Grid agents get no series.
pub fn generate_mock_data(
    agents: &[AgentSpec],
    constants: &MockDataConstants,
    periods: &[DateTime<Utc>],
) -> HashMap<String, AgentMockSeries> {
    let seed = mock_data_seed(agents, constants);
    let mut result = HashMap::new();
    for agent in agents {
        if agent.agent_type == "GridAgent" {
            continue;
        }
        let agent_seed = seed ^ xxh64(agent.name.as_bytes(), 1);
        let commercial = agent.agent_type == "GroceryStoreAgent";
        let series = generate_agent_series(agent, constants, periods, agent_seed, commercial);
        result.insert(agent.name.clone(), series);
    }
    result
}

fn generate_agent_series(
    agent: &AgentSpec,
    constants: &MockDataConstants,
    periods: &[DateTime<Utc>],
    seed: u64,
    commercial: bool,
) -> AgentMockSeries {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = Normal::new(1.0, constants.relative_error_std_dev).unwrap_or_else(|_| {
        Normal::new(1.0, 0.0).expect("zero std dev is valid")
    });
    let area = agent.gross_floor_area;
    let (elec_per_m2, heat_per_m2, hot_water_per_m2, cooling_per_m2) = if commercial {
        (
            constants.commercial_elec_kwh_per_year_m2,
            constants.commercial_space_heat_kwh_per_year_m2,
            constants.residential_hot_tap_water_kwh_per_year_m2,
            constants.commercial_cooling_kwh_per_year_m2,
        )
    } else {
        (
            constants.residential_elec_kwh_per_year_m2,
            constants.residential_space_heat_kwh_per_year_m2,
            constants.residential_hot_tap_water_kwh_per_year_m2,
            0.0,
        )
    };

    let mut series = AgentMockSeries::default();
    for &period in periods {
        let draw = |rng: &mut ChaCha8Rng| noise.sample(rng).max(0.0);
        let elec = elec_per_m2 * area / HOURS_PER_YEAR
            * diurnal_shape(period, commercial)
            * draw(&mut rng);
        let heat = heat_per_m2 * area / HOURS_PER_YEAR
            * heating_season_shape(period)
            * draw(&mut rng);
        let hot_water = hot_water_per_m2 * area / HOURS_PER_YEAR
            * hot_water_shape(period)
            * draw(&mut rng);
        let cooling = cooling_per_m2 * area / HOURS_PER_YEAR
            * cooling_season_shape(period)
            * draw(&mut rng);
        series.elec_cons.insert(period, elec);
        series.space_heat_cons.insert(period, heat);
        series.hot_water_cons.insert(period, hot_water);
        series.cooling_cons.insert(period, cooling);
        if commercial && agent.sell_excess_heat {
            // Cooling machines reject usable heat
            series.excess_heat_prod.insert(period, cooling * 0.5);
        }
    }
    series
}

/// Irradiation, temperature and spot prices for the same period range.
pub fn generate_input_series(periods: &[DateTime<Utc>], seed: u64) -> InputSeries {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x1ec5);
    let noise = Normal::new(0.0, 0.05).expect("valid std dev");
    let mut inputs = InputSeries::default();
    for &period in periods {
        let day_fraction = seasonal_position(period);
        let hour = period.hour() as f64;

        // Daylight bell between 06 and 20, stronger in summer
        let daylight = ((hour - 6.0) / 14.0 * PI).sin().max(0.0);
        let summer_strength = 0.35 + 0.65 * (0.5 - 0.5 * (day_fraction * 2.0 * PI).cos());
        inputs.irradiation.insert(period, 900.0 * daylight * summer_strength);

        let seasonal_temp = -2.0 + 20.0 * (0.5 - 0.5 * (day_fraction * 2.0 * PI).cos());
        let diurnal_temp = 3.0 * ((hour - 14.0) / 24.0 * 2.0 * PI).cos();
        inputs.temperature.insert(period, seasonal_temp + diurnal_temp);

        let winter_uplift = 0.25 * (0.5 + 0.5 * (day_fraction * 2.0 * PI).cos());
        let evening_uplift = if (17..=20).contains(&period.hour()) { 0.2 } else { 0.0 };
        let spot =
            (0.45 + winter_uplift + evening_uplift + noise.sample(&mut rng)).max(0.01);
        inputs.nordpool_price.insert(period, spot);
    }
    inputs
}

/// Position within the year in `[0, 1)`, 0 at new year.
fn seasonal_position(period: DateTime<Utc>) -> f64 {
    (period.ordinal0() as f64) / 365.0
}

/// Space heating follows the cold season; nothing in high summer.
fn heating_season_shape(period: DateTime<Utc>) -> f64 {
    let winter = 0.5 + 0.5 * (seasonal_position(period) * 2.0 * PI).cos();
    2.0 * winter * winter
}

fn cooling_season_shape(period: DateTime<Utc>) -> f64 {
    let summer = 0.5 - 0.5 * (seasonal_position(period) * 2.0 * PI).cos();
    2.0 * summer * summer
}

/// Household/workplace electricity: morning and evening peaks for homes,
/// office-hours plateau for commercial buildings.
fn diurnal_shape(period: DateTime<Utc>, commercial: bool) -> f64 {
    let hour = period.hour();
    if commercial {
        if (8..=20).contains(&hour) {
            1.5
        } else {
            0.55
        }
    } else {
        match hour {
            7..=9 => 1.4,
            17..=21 => 1.6,
            0..=5 => 0.6,
            _ => 1.0,
        }
    }
}

fn hot_water_shape(period: DateTime<Utc>) -> f64 {
    match period.hour() {
        6..=9 => 1.8,
        18..=22 => 1.5,
        0..=4 => 0.3,
        _ => 0.9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hourly_range;
    use chrono::TimeZone;

    fn agents() -> Vec<AgentSpec> {
        vec![
            AgentSpec {
                name: "Block1".into(),
                agent_type: "BlockAgent".into(),
                gross_floor_area: 10_000.0,
                ..Default::default()
            },
            AgentSpec {
                name: "Coop".into(),
                agent_type: "GroceryStoreAgent".into(),
                gross_floor_area: 6_000.0,
                sell_excess_heat: true,
                ..Default::default()
            },
            AgentSpec {
                name: "ElecGrid".into(),
                agent_type: "GridAgent".into(),
                resource: Some("ELECTRICITY".into()),
                ..Default::default()
            },
        ]
    }

    fn periods() -> Vec<DateTime<Utc>> {
        hourly_range(Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap(), 48)
    }

    #[test]
    fn test_same_config_same_series() {
        let constants = MockDataConstants::default();
        let first = generate_mock_data(&agents(), &constants, &periods());
        let second = generate_mock_data(&agents(), &constants, &periods());
        let a = &first["Block1"].elec_cons;
        let b = &second["Block1"].elec_cons;
        assert_eq!(a, b, "identical configuration must reproduce identical draws");
    }

    #[test]
    fn test_changed_constants_change_seed() {
        let constants = MockDataConstants::default();
        let mut altered = constants.clone();
        altered.residential_elec_kwh_per_year_m2 += 1.0;
        assert_ne!(mock_data_seed(&agents(), &constants), mock_data_seed(&agents(), &altered));
    }

    #[test]
    fn test_agent_order_does_not_change_seed() {
        let constants = MockDataConstants::default();
        let mut reversed = agents();
        reversed.reverse();
        assert_eq!(mock_data_seed(&agents(), &constants), mock_data_seed(&reversed, &constants));
    }

    #[test]
    fn test_grid_agents_get_no_series() {
        let constants = MockDataConstants::default();
        let data = generate_mock_data(&agents(), &constants, &periods());
        assert!(!data.contains_key("ElecGrid"));
        assert!(data.contains_key("Block1"));
    }

    #[test]
    fn test_grocery_store_offers_excess_heat() {
        let constants = MockDataConstants::default();
        let data = generate_mock_data(&agents(), &constants, &periods());
        assert!(!data["Coop"].excess_heat_prod.is_empty());
        assert!(data["Block1"].excess_heat_prod.is_empty());
    }

    #[test]
    fn test_input_series_shapes() {
        let inputs = generate_input_series(&periods(), 42);
        assert_eq!(inputs.nordpool_price.len(), 48);
        let midnight = Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2019, 2, 1, 12, 0, 0).unwrap();
        assert_eq!(inputs.irradiation[&midnight], 0.0);
        assert!(inputs.irradiation[&noon] > 0.0);
        assert!(inputs.nordpool_price.values().all(|&p| p > 0.0));
    }
}
