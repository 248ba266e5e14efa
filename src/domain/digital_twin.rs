use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use super::types::Resource;

/// Hourly energy series keyed by UTC timestamp, values in kWh.
pub type HourlySeries = BTreeMap<DateTime<Utc>, f64>;

/// Immutable per-agent record of realised demand and production.
///
/// Pure data holder: querying a period/resource combination for which no
/// series was registered yields zero.
#[derive(Debug, Clone, Default)]
pub struct StaticDigitalTwin {
    /// Heated floor area in m2, the basis for the building-inertia storage.
    pub atemp_m2: f64,
    /// Whether this building's heat pump can run in reverse and produce
    /// cooling.
    pub hp_produce_cooling: bool,
    consumption: HashMap<Resource, HourlySeries>,
    production: HashMap<Resource, HourlySeries>,
}

impl StaticDigitalTwin {
    pub fn new(atemp_m2: f64, hp_produce_cooling: bool) -> Self {
        Self { atemp_m2, hp_produce_cooling, ..Default::default() }
    }

    pub fn with_consumption(mut self, resource: Resource, series: HourlySeries) -> Self {
        self.consumption.insert(resource, series);
        self
    }

    pub fn with_production(mut self, resource: Resource, series: HourlySeries) -> Self {
        self.production.insert(resource, series);
        self
    }

    pub fn get_consumption(&self, period: DateTime<Utc>, resource: Resource) -> f64 {
        self.consumption
            .get(&resource)
            .and_then(|series| series.get(&period))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn get_production(&self, period: DateTime<Utc>, resource: Resource) -> f64 {
        self.production
            .get(&resource)
            .and_then(|series| series.get(&period))
            .copied()
            .unwrap_or(0.0)
    }

    /// Net use of a resource: consumption minus production. Negative values
    /// mean the agent has a surplus to offer.
    pub fn net_use(&self, period: DateTime<Utc>, resource: Resource) -> f64 {
        self.get_consumption(period, resource) - self.get_production(period, resource)
    }

    /// Shortest registered series length, used to validate that a horizon
    /// fits inside the data.
    pub fn series_len(&self) -> Option<usize> {
        self.consumption
            .values()
            .chain(self.production.values())
            .map(|s| s.len())
            .min()
    }
}

/// Converts irradiation (W/m2) into PV production (kWh) for a panel area at
/// a given efficiency.
pub fn solar_production(irradiation_w_m2: f64, pv_sqm: f64, pv_efficiency: f64) -> f64 {
    irradiation_w_m2 * pv_sqm * pv_efficiency / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_net_use_defaults_to_zero() {
        let twin = StaticDigitalTwin::new(1000.0, false);
        let period = Utc.with_ymd_and_hms(2019, 2, 1, 1, 0, 0).unwrap();
        assert_eq!(twin.net_use(period, Resource::Electricity), 0.0);
    }

    #[test]
    fn test_consumption_and_production() {
        let period = Utc.with_ymd_and_hms(2019, 2, 1, 1, 0, 0).unwrap();
        let mut cons = HourlySeries::new();
        cons.insert(period, 150.0);
        let mut prod = HourlySeries::new();
        prod.insert(period, 30.0);
        let twin = StaticDigitalTwin::new(1000.0, false)
            .with_consumption(Resource::Electricity, cons)
            .with_production(Resource::Electricity, prod);
        assert_eq!(twin.get_consumption(period, Resource::Electricity), 150.0);
        assert_eq!(twin.net_use(period, Resource::Electricity), 120.0);
    }

    #[test]
    fn test_solar_production() {
        assert!((solar_production(500.0, 100.0, 0.18) - 9.0).abs() < 1e-12);
    }
}
