use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::digital_twin::StaticDigitalTwin;
use super::types::Resource;

/// Accumulator tanks are kept at this temperature ceiling, degrees Celsius.
pub const ACC_TANK_TEMPERATURE: f64 = 65.0;

/// Energy needed to heat one m3 of water by one degree Celsius, in kWh.
/// Specific heat of water 4182 J/(kg C), density 998 kg/m3.
const KWH_PER_M3_PER_DEG: f64 = 4182.0 * 998.0 / 3_600_000.0;

pub fn kwh_per_deg_for_volume(volume_m3: f64) -> f64 {
    volume_m3 * KWH_PER_M3_PER_DEG
}

/// Inverse of the tank sizing: the water volume needed to store
/// `capacity_kwh` across a `max_temp_c` temperature swing.
pub fn energy_to_water_volume(capacity_kwh: f64, max_temp_c: f64) -> f64 {
    if capacity_kwh == 0.0 {
        return 0.0;
    }
    capacity_kwh / (KWH_PER_M3_PER_DEG * max_temp_c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum AgentType {
    BlockAgent,
    GridAgent,
    HeatProducerAgent,
    GroceryStoreAgent,
}

/// Battery electrical storage parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Battery {
    pub max_capacity_kwh: f64,
    pub charge_limit_kwh: f64,
    pub discharge_limit_kwh: f64,
    pub efficiency: f64,
}

impl Battery {
    pub fn new(
        max_capacity_kwh: f64,
        charge_rate_fraction: f64,
        discharge_rate_fraction: f64,
        efficiency: f64,
    ) -> Self {
        Self {
            max_capacity_kwh,
            charge_limit_kwh: max_capacity_kwh * charge_rate_fraction,
            discharge_limit_kwh: max_capacity_kwh * discharge_rate_fraction,
            efficiency,
        }
    }

    pub fn none() -> Self {
        Self { max_capacity_kwh: 0.0, charge_limit_kwh: 0.0, discharge_limit_kwh: 0.0, efficiency: 1.0 }
    }
}

/// Two-layer building-inertia storage parameters, derived from the floor
/// area made available for thermal storage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BitesParameters {
    pub shallow_capacity_kwh: f64,
    pub deep_capacity_kwh: f64,
    pub inter_layer_k: f64,
    pub max_shallow_rate_kwh: f64,
}

impl BitesParameters {
    pub fn for_area(bites_area_m2: f64) -> Self {
        Self {
            shallow_capacity_kwh: 0.046 * bites_area_m2,
            deep_capacity_kwh: 0.291 * bites_area_m2,
            inter_layer_k: 0.03 * bites_area_m2,
            max_shallow_rate_kwh: 0.023 * bites_area_m2,
        }
    }
}

/// A building block participating in the community: owns a digital twin and
/// an optional set of flexibility devices.
#[derive(Debug, Clone)]
pub struct BlockAgent {
    pub guid: String,
    pub digital_twin: StaticDigitalTwin,
    pub battery: Battery,
    pub heat_pump_max_input: f64,
    pub heat_pump_max_output: f64,
    pub booster_pump_max_input: f64,
    pub booster_pump_max_output: f64,
    /// Accumulator tank size in m3.
    pub acc_tank_volume: f64,
    /// Fraction of the heated floor area usable as thermal inertia storage.
    pub frac_for_bites: f64,
    /// Free cooling from a borehole, available outside June-August.
    pub has_borehole: bool,
}

impl BlockAgent {
    pub fn acc_tank_kwh_per_deg(&self) -> f64 {
        kwh_per_deg_for_volume(self.acc_tank_volume)
    }
}

/// The community's connection to one external utility. Bound to exactly one
/// resource; `can_buy` says whether the utility accepts exports.
#[derive(Debug, Clone)]
pub struct GridAgent {
    pub guid: String,
    pub resource: Resource,
    pub max_transfer_per_hour: f64,
    pub can_buy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kwh_per_deg() {
        // A 10 m3 tank holds roughly 1.16 kWh per degree
        let per_deg = kwh_per_deg_for_volume(10.0);
        assert!((per_deg - 11.593).abs() < 0.01);
    }

    #[test]
    fn test_energy_volume_roundtrip() {
        let volume = energy_to_water_volume(100.0, ACC_TANK_TEMPERATURE);
        assert!((kwh_per_deg_for_volume(volume) * ACC_TANK_TEMPERATURE - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_bites_parameters_scale_with_area() {
        let params = BitesParameters::for_area(1000.0);
        assert!((params.shallow_capacity_kwh - 46.0).abs() < 1e-9);
        assert!((params.deep_capacity_kwh - 291.0).abs() < 1e-9);
        assert!((params.inter_layer_k - 30.0).abs() < 1e-9);
        assert!((params.max_shallow_rate_kwh - 23.0).abs() < 1e-9);
    }

    #[test]
    fn test_battery_rate_fractions() {
        let battery = Battery::new(20.0, 0.4, 0.5, 0.95);
        assert!((battery.charge_limit_kwh - 8.0).abs() < 1e-9);
        assert!((battery.discharge_limit_kwh - 10.0).abs() < 1e-9);
    }
}
