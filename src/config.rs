use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::IntoEnumIterator;
use validator::Validate;

use crate::domain::{AgentType, Resource};
use crate::error::ConfigError;

/// Process-level configuration: where to persist, how to log, how the year is
/// partitioned. The scenario itself (agents, tariffs) is a separate document
/// addressed by `--config-id`.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Directory holding scenario documents, one `<config-id>.toml` each.
    #[serde(default = "default_scenario_dir")]
    pub scenario_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SimulationConfig {
    /// First simulated hour, UTC, "YYYY-MM-DDTHH:00:00Z".
    #[serde(default = "default_start")]
    pub start: chrono::DateTime<chrono::Utc>,

    /// Number of simulated days.
    #[validate(range(min = 1, max = 366))]
    #[serde(default = "default_days")]
    pub days: u32,

    /// Horizons are grouped into this many persistence batches.
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_batches")]
    pub number_of_batches: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { start: default_start(), days: default_days(), number_of_batches: default_batches() }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_scenario_dir() -> PathBuf {
    PathBuf::from("config/scenarios")
}
fn default_start() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339("2019-02-01T00:00:00Z")
        .expect("valid default start")
        .with_timezone(&chrono::Utc)
}
fn default_days() -> u32 {
    365
}
fn default_batches() -> usize {
    5
}
fn default_db_max_connections() -> u32 {
    10
}

impl AppConfig {
    /// Loads `config/default.toml` overridden by `LEC__`-prefixed environment
    /// variables (`LEC__SIMULATION__DAYS` and so on).
    pub fn load() -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("LEC__").split("__"))
            .extract()
            .context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }
}

/// Community parameters and tariff scalars, named as in the scenario
/// documents.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AreaInfo {
    pub trading_horizon: usize,
    pub local_market_enabled: bool,
    #[serde(rename = "PVEfficiency")]
    pub pv_efficiency: f64,
    pub battery_charge_rate: f64,
    pub battery_discharge_rate: f64,
    pub battery_efficiency: f64,
    pub acc_tank_efficiency: f64,
    pub inter_agent_electricity_transfer_capacity: f64,
    pub inter_agent_heat_transfer_capacity: f64,
    #[serde(rename = "CompChillerCOP")]
    pub comp_chiller_cop: f64,
    pub comp_chiller_heat_recovery: f64,
    pub comp_chiller_max_input: f64,
    pub heat_transfer_loss: f64,
    pub cooling_transfer_loss: f64,
    #[serde(rename = "COPHeatPumpsHighTemp")]
    pub cop_heat_pumps_high_temp: f64,
    #[serde(rename = "COPHeatPumpsLowTemp")]
    pub cop_heat_pumps_low_temp: f64,
    #[serde(rename = "COPBoosterPumps")]
    pub cop_booster_pumps: f64,
    /// SOC every battery and accumulator tank starts and ends each horizon at.
    pub storage_end_charge_level: f64,
    pub electricity_tax: f64,
    pub electricity_grid_fee: f64,
    pub electricity_tax_internal: f64,
    pub electricity_grid_fee_internal: f64,
    pub external_electricity_wholesale_price_offset: f64,
    pub external_heating_wholesale_price_fraction: f64,
    #[serde(default = "default_elec_effect_fee")]
    pub electricity_effect_fee: f64,
    #[serde(default = "default_heat_effect_fee")]
    pub heating_effect_fee: f64,
}

fn default_elec_effect_fee() -> f64 {
    35.0
}
fn default_heat_effect_fee() -> f64 {
    crate::pricing::heating::DEFAULT_EFFECT_FEE
}

/// The default community setup: a 24 h horizon with the internal market on,
/// Swedish tariff scalars, and the Varberg-style heating fees.
impl Default for AreaInfo {
    fn default() -> Self {
        Self {
            trading_horizon: 24,
            local_market_enabled: true,
            pv_efficiency: 0.18,
            battery_charge_rate: 0.4,
            battery_discharge_rate: 0.5,
            battery_efficiency: 0.93,
            acc_tank_efficiency: 0.98,
            inter_agent_electricity_transfer_capacity: 500.0,
            inter_agent_heat_transfer_capacity: 500.0,
            comp_chiller_cop: 1.5,
            comp_chiller_heat_recovery: 0.5,
            comp_chiller_max_input: 100.0,
            heat_transfer_loss: 0.05,
            cooling_transfer_loss: 0.05,
            cop_heat_pumps_high_temp: 2.8,
            cop_heat_pumps_low_temp: 3.6,
            cop_booster_pumps: 3.0,
            storage_end_charge_level: 0.5,
            electricity_tax: 0.392,
            electricity_grid_fee: 0.148,
            electricity_tax_internal: 0.392,
            electricity_grid_fee_internal: 0.0,
            external_electricity_wholesale_price_offset: 0.05,
            external_heating_wholesale_price_fraction: 0.5,
            electricity_effect_fee: default_elec_effect_fee(),
            heating_effect_fee: default_heat_effect_fee(),
        }
    }
}

/// One agent entry of a scenario document. Which fields apply depends on the
/// agent type; unknown types are rejected during validation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentSpec {
    pub name: String,
    #[serde(rename = "Type")]
    pub agent_type: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub transfer_rate: Option<f64>,
    #[serde(default)]
    pub gross_floor_area: f64,
    #[serde(rename = "PVArea", default)]
    pub pv_area: f64,
    #[serde(rename = "PVEfficiency", default)]
    pub pv_efficiency: Option<f64>,
    #[serde(rename = "FractionUsedForBITES", default)]
    pub fraction_used_for_bites: f64,
    #[serde(default)]
    pub heat_pump_max_input: f64,
    #[serde(default)]
    pub heat_pump_max_output: f64,
    #[serde(default)]
    pub booster_pump_max_input: f64,
    #[serde(default)]
    pub booster_pump_max_output: f64,
    /// Accumulator tank capacity in kWh across the full temperature swing.
    #[serde(default)]
    pub accumulator_tank_capacity: f64,
    #[serde(default)]
    pub battery_capacity: f64,
    #[serde(default)]
    pub heat_pump_for_cooling: bool,
    #[serde(default)]
    pub borehole: bool,
    #[serde(default)]
    pub sell_excess_heat: bool,
    /// Constant hourly heat output for heat producer agents, kWh.
    #[serde(default)]
    pub heat_production: f64,
}

impl AgentSpec {
    pub fn parsed_type(&self) -> Result<AgentType, ConfigError> {
        AgentType::from_str(&self.agent_type)
            .map_err(|_| ConfigError::UnknownAgentType(self.agent_type.clone()))
    }

    pub fn parsed_resource(&self) -> Result<Resource, ConfigError> {
        let raw = self
            .resource
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField(format!("{}.Resource", self.name)))?;
        Resource::from_str(raw).map_err(|_| ConfigError::InvalidValue {
            field: format!("{}.Resource", self.name),
            reason: format!("unknown resource '{raw}'"),
        })
    }
}

/// Constants steering the deterministic mock-data synthesis. Part of the
/// scenario identity: two scenarios with equal agent sets and equal constants
/// share mock data bit for bit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MockDataConstants {
    #[serde(default = "d20")]
    pub residential_elec_kwh_per_year_m2: f64,
    #[serde(default = "d25")]
    pub residential_space_heat_kwh_per_year_m2: f64,
    #[serde(default = "d25")]
    pub residential_hot_tap_water_kwh_per_year_m2: f64,
    #[serde(default = "d118")]
    pub commercial_elec_kwh_per_year_m2: f64,
    #[serde(default = "d32")]
    pub commercial_space_heat_kwh_per_year_m2: f64,
    #[serde(default = "d34")]
    pub commercial_cooling_kwh_per_year_m2: f64,
    #[serde(default = "d02")]
    pub relative_error_std_dev: f64,
}

impl Default for MockDataConstants {
    fn default() -> Self {
        Self {
            residential_elec_kwh_per_year_m2: d20(),
            residential_space_heat_kwh_per_year_m2: d25(),
            residential_hot_tap_water_kwh_per_year_m2: d25(),
            commercial_elec_kwh_per_year_m2: d118(),
            commercial_space_heat_kwh_per_year_m2: d32(),
            commercial_cooling_kwh_per_year_m2: d34(),
            relative_error_std_dev: d02(),
        }
    }
}

fn d20() -> f64 {
    20.0
}
fn d25() -> f64 {
    25.0
}
fn d118() -> f64 {
    118.0
}
fn d32() -> f64 {
    32.0
}
fn d34() -> f64 {
    34.0
}
fn d02() -> f64 {
    0.2
}

/// A scenario: the community, its tariffs and its mock-data constants.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    #[serde(rename = "AreaInfo")]
    pub area_info: AreaInfo,
    #[serde(rename = "Agents")]
    pub agents: Vec<AgentSpec>,
    #[serde(rename = "MockDataConstants", default)]
    pub mock_data_constants: MockDataConstants,
}

impl ScenarioConfig {
    pub fn load(scenario_dir: &Path, config_id: &str) -> Result<Self, ConfigError> {
        let path = scenario_dir.join(format!("{config_id}.toml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: ScenarioConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Io(e.to_string()))?;
        config.validate_semantics()?;
        Ok(config)
    }

    /// Checks the invariants serde cannot express: known agent types, exactly
    /// one grid agent per externally traded resource, loss fractions that
    /// keep the MILP well posed.
    pub fn validate_semantics(&self) -> Result<(), ConfigError> {
        let mut grid_agents_per_resource: HashMap<Resource, usize> = HashMap::new();
        for agent in &self.agents {
            if agent.name.is_empty() {
                return Err(ConfigError::MissingField("Agent.Name".into()));
            }
            match agent.parsed_type()? {
                AgentType::GridAgent => {
                    let resource = agent.parsed_resource()?;
                    if !resource.has_external_market() {
                        return Err(ConfigError::InvalidValue {
                            field: format!("{}.Resource", agent.name),
                            reason: format!("no external market exists for {resource}"),
                        });
                    }
                    *grid_agents_per_resource.entry(resource).or_insert(0) += 1;
                }
                AgentType::BlockAgent
                | AgentType::GroceryStoreAgent
                | AgentType::HeatProducerAgent => {}
            }
        }
        if grid_agents_per_resource.is_empty() {
            return Err(ConfigError::NoGridAgent);
        }
        for resource in Resource::iter().filter(|r| r.has_external_market()) {
            match grid_agents_per_resource.get(&resource) {
                None => return Err(ConfigError::NoGridAgentForResource(resource.to_string())),
                Some(1) => {}
                Some(count) => {
                    return Err(ConfigError::InvalidValue {
                        field: "Agents".into(),
                        reason: format!("{count} grid agents configured for {resource}"),
                    })
                }
            }
        }
        if !(self.area_info.heat_transfer_loss > 0.0 && self.area_info.heat_transfer_loss < 1.0) {
            // A zero loss would allow simultaneous buying and selling of heat
            return Err(ConfigError::InvalidValue {
                field: "AreaInfo.HeatTransferLoss".into(),
                reason: "must be in (0, 1)".into(),
            });
        }
        if !(0.0..1.0).contains(&self.area_info.cooling_transfer_loss) {
            return Err(ConfigError::InvalidValue {
                field: "AreaInfo.CoolingTransferLoss".into(),
                reason: "must be in [0, 1)".into(),
            });
        }
        if self.area_info.battery_efficiency <= 0.0 || self.area_info.acc_tank_efficiency <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "AreaInfo.BatteryEfficiency/AccTankEfficiency".into(),
                reason: "must be positive".into(),
            });
        }
        if self.area_info.trading_horizon == 0 {
            return Err(ConfigError::InvalidValue {
                field: "AreaInfo.TradingHorizon".into(),
                reason: "must be at least one hour".into(),
            });
        }
        if self.mock_data_constants.relative_error_std_dev < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "MockDataConstants.RelativeErrorStdDev".into(),
                reason: "must be non-negative".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            agent_type: "BlockAgent".into(),
            gross_floor_area: 10_000.0,
            ..Default::default()
        }
    }

    fn grid(name: &str, resource: &str) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            agent_type: "GridAgent".into(),
            resource: Some(resource.into()),
            transfer_rate: Some(10_000.0),
            ..Default::default()
        }
    }

    fn scenario(agents: Vec<AgentSpec>) -> ScenarioConfig {
        ScenarioConfig {
            area_info: AreaInfo::default(),
            agents,
            mock_data_constants: MockDataConstants::default(),
        }
    }

    #[test]
    fn test_valid_scenario() {
        let config = scenario(vec![
            block("Block1"),
            grid("ElecGrid", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
        ]);
        assert!(config.validate_semantics().is_ok());
    }

    #[test]
    fn test_missing_grid_agent() {
        let config = scenario(vec![block("Block1")]);
        assert!(matches!(config.validate_semantics(), Err(ConfigError::NoGridAgent)));
    }

    #[test]
    fn test_missing_heat_grid_agent() {
        let config = scenario(vec![block("Block1"), grid("ElecGrid", "ELECTRICITY")]);
        assert!(matches!(
            config.validate_semantics(),
            Err(ConfigError::NoGridAgentForResource(_))
        ));
    }

    #[test]
    fn test_unknown_agent_type() {
        let mut bad = block("Block1");
        bad.agent_type = "WindFarmAgent".into();
        let config = scenario(vec![
            bad,
            grid("ElecGrid", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
        ]);
        assert!(matches!(config.validate_semantics(), Err(ConfigError::UnknownAgentType(_))));
    }

    #[test]
    fn test_duplicate_grid_agents_rejected() {
        let config = scenario(vec![
            block("Block1"),
            grid("ElecGrid", "ELECTRICITY"),
            grid("ElecGrid2", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
        ]);
        assert!(matches!(config.validate_semantics(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_grid_agent_for_unmarketed_resource_rejected() {
        let config = scenario(vec![
            block("Block1"),
            grid("ElecGrid", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
            grid("CoolGrid", "COOLING"),
        ]);
        assert!(matches!(config.validate_semantics(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_heat_loss_rejected() {
        let mut config = scenario(vec![
            block("Block1"),
            grid("ElecGrid", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
        ]);
        config.area_info.heat_transfer_loss = 0.0;
        assert!(config.validate_semantics().is_err());
    }

    #[test]
    fn test_scenario_toml_roundtrip() {
        let config = scenario(vec![
            block("Block1"),
            grid("ElecGrid", "ELECTRICITY"),
            grid("HeatGrid", "HIGH_TEMP_HEAT"),
        ]);
        let serialized = toml::to_string(&config).unwrap();
        let parsed: ScenarioConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.agents.len(), 3);
        assert_eq!(parsed.area_info.trading_horizon, 24);
    }
}
