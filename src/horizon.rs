//! Horizon assembly: turning agent digital twins and tariff state into the
//! dense parameter block one MILP solve consumes, and failing fast on demand
//! no schedule could ever serve.

use chrono::{DateTime, Datelike, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::config::AreaInfo;
use crate::domain::{
    hourly_range, is_summer_month, should_use_summer_mode, BlockAgent, GridAgent, Resource,
    ACC_TANK_TEMPERATURE,
};
use crate::error::{SimulationError, UnfillableDemand};
use crate::pricing::{ElectricityPrice, HeatingPrice};

/// Dense `agents x hours` matrix.
pub type Matrix = Vec<Vec<f64>>;

/// Everything one horizon's optimisation needs, in agent order. The agent
/// order established at configuration load is used throughout: matrices,
/// parameter vectors and the solved model all index agents the same way.
#[derive(Debug, Clone)]
pub struct HorizonInputs {
    pub start: DateTime<Utc>,
    pub horizon: usize,
    pub month: u32,
    pub summer_mode: bool,
    pub agent_guids: Vec<String>,

    // Demand/supply split per resource, kWh
    pub elec_demand: Matrix,
    pub elec_supply: Matrix,
    pub high_heat_demand: Matrix,
    pub high_heat_supply: Matrix,
    pub low_heat_demand: Matrix,
    pub low_heat_supply: Matrix,
    pub cooling_demand: Matrix,
    pub cooling_supply: Matrix,

    // Device parameters per agent
    pub battery_capacity: Vec<f64>,
    pub battery_max_charge: Vec<f64>,
    pub battery_max_discharge: Vec<f64>,
    pub heatpump_max_power: Vec<f64>,
    pub heatpump_max_heat: Vec<f64>,
    pub booster_max_power: Vec<f64>,
    pub booster_max_heat: Vec<f64>,
    pub acc_tank_kwh_per_deg: Vec<f64>,
    pub bites_area: Vec<f64>,
    pub hp_produce_cooling: Vec<bool>,
    pub borehole: Vec<bool>,
    pub shallow_storage_start: Vec<f64>,
    pub deep_storage_start: Vec<f64>,

    // Price and tariff scalars for the horizon
    pub nordpool_price: Vec<f64>,
    pub heat_retail_price: f64,
    pub elec_tax_fee: f64,
    pub elec_trans_fee: f64,
    pub elec_peak_load_fee: f64,
    pub heat_peak_load_fee: f64,
    pub incentive_fee: f64,
    pub hist_top_three_elec_peak_load: [f64; 3],
    pub hist_monthly_heat_peak_energy: f64,

    // Community scalars
    pub heat_pump_cop: f64,
    pub booster_cop: f64,
    pub battery_efficiency: f64,
    pub acc_tank_efficiency: f64,
    pub acc_tank_max_temp: f64,
    pub max_elec_transfer_between_agents: f64,
    pub max_elec_transfer_to_external: f64,
    pub max_heat_transfer_between_agents: f64,
    pub max_heat_transfer_to_external: f64,
    pub chiller_cop: f64,
    pub chiller_heat_recovery: f64,
    pub chiller_max_input: f64,
    pub heat_trans_loss: f64,
    pub cold_trans_loss: f64,
    pub storage_end_charge_level: f64,
    pub penalty: f64,
}

impl HorizonInputs {
    pub fn n_agents(&self) -> usize {
        self.agent_guids.len()
    }

    pub fn periods(&self) -> Vec<DateTime<Utc>> {
        hourly_range(self.start, self.horizon)
    }
}

/// Big-M penalty on the heat/cool dump sinks keeping the model feasible.
const DUMP_PENALTY: f64 = 1000.0;

#[allow(clippy::too_many_arguments)]
pub fn assemble_horizon(
    agents: &[BlockAgent],
    elec_grid: &GridAgent,
    heat_grid: &GridAgent,
    area_info: &AreaInfo,
    elec_pricing: &ElectricityPrice,
    heat_pricing: &HeatingPrice,
    start: DateTime<Utc>,
    shallow_storage_start: &HashMap<String, f64>,
    deep_storage_start: &HashMap<String, f64>,
) -> Result<HorizonInputs, SimulationError> {
    let horizon = area_info.trading_horizon;
    let summer_mode = should_use_summer_mode(start);
    let month = start.month();
    let periods = hourly_range(start, horizon);
    let agent_guids: Vec<String> = agents.iter().map(|a| a.guid.clone()).collect();

    let mut matrices = SupplyAndDemand::with_capacity(agents.len());
    for agent in agents {
        matrices.push_agent(agent, &periods);
    }

    let inputs = HorizonInputs {
        start,
        horizon,
        month,
        summer_mode,
        agent_guids: agent_guids.clone(),
        elec_demand: matrices.elec_demand,
        elec_supply: matrices.elec_supply,
        high_heat_demand: matrices.high_heat_demand,
        high_heat_supply: matrices.high_heat_supply,
        low_heat_demand: matrices.low_heat_demand,
        low_heat_supply: matrices.low_heat_supply,
        cooling_demand: matrices.cooling_demand,
        cooling_supply: matrices.cooling_supply,
        battery_capacity: agents.iter().map(|a| a.battery.max_capacity_kwh).collect(),
        battery_max_charge: agents.iter().map(|a| a.battery.charge_limit_kwh).collect(),
        battery_max_discharge: agents.iter().map(|a| a.battery.discharge_limit_kwh).collect(),
        heatpump_max_power: agents.iter().map(|a| a.heat_pump_max_input).collect(),
        heatpump_max_heat: agents.iter().map(|a| a.heat_pump_max_output).collect(),
        booster_max_power: agents.iter().map(|a| a.booster_pump_max_input).collect(),
        booster_max_heat: agents.iter().map(|a| a.booster_pump_max_output).collect(),
        acc_tank_kwh_per_deg: agents.iter().map(|a| a.acc_tank_kwh_per_deg()).collect(),
        bites_area: agents
            .iter()
            .map(|a| a.digital_twin.atemp_m2 * a.frac_for_bites)
            .collect(),
        hp_produce_cooling: agents.iter().map(|a| a.digital_twin.hp_produce_cooling).collect(),
        borehole: agents.iter().map(|a| a.has_borehole).collect(),
        shallow_storage_start: agent_guids
            .iter()
            .map(|guid| shallow_storage_start.get(guid).copied().unwrap_or(0.0))
            .collect(),
        deep_storage_start: agent_guids
            .iter()
            .map(|guid| deep_storage_start.get(guid).copied().unwrap_or(0.0))
            .collect(),
        nordpool_price: elec_pricing
            .nordpool_prices_for_horizon(start, horizon)
            .map_err(SimulationError::Config)?,
        heat_retail_price: heat_pricing.retail_price_excl_effect_fee(start),
        elec_tax_fee: elec_pricing.tax,
        elec_trans_fee: elec_pricing.transmission_fee,
        elec_peak_load_fee: elec_pricing.effect_fee_per_day(start),
        heat_peak_load_fee: heat_pricing.effect_fee_per_day(start),
        incentive_fee: elec_pricing.wholesale_offset,
        hist_top_three_elec_peak_load: elec_pricing.top_three_hourly_outtakes(start, None),
        hist_monthly_heat_peak_energy: heat_pricing.avg_peak_for_month(start, None),
        heat_pump_cop: if summer_mode {
            area_info.cop_heat_pumps_low_temp
        } else {
            area_info.cop_heat_pumps_high_temp
        },
        booster_cop: area_info.cop_booster_pumps,
        battery_efficiency: area_info.battery_efficiency,
        acc_tank_efficiency: area_info.acc_tank_efficiency,
        acc_tank_max_temp: ACC_TANK_TEMPERATURE,
        max_elec_transfer_between_agents: area_info.inter_agent_electricity_transfer_capacity,
        max_elec_transfer_to_external: elec_grid.max_transfer_per_hour,
        max_heat_transfer_between_agents: area_info.inter_agent_heat_transfer_capacity,
        max_heat_transfer_to_external: heat_grid.max_transfer_per_hour,
        chiller_cop: area_info.comp_chiller_cop,
        chiller_heat_recovery: area_info.comp_chiller_heat_recovery,
        chiller_max_input: area_info.comp_chiller_max_input,
        heat_trans_loss: area_info.heat_transfer_loss,
        cold_trans_loss: area_info.cooling_transfer_loss,
        storage_end_charge_level: area_info.storage_end_charge_level,
        penalty: DUMP_PENALTY,
    };

    check_series_cover_horizon(agents, &periods)?;
    check_hot_water_fillable(&inputs)?;
    check_cooling_fillable(&inputs)?;
    Ok(inputs)
}

struct SupplyAndDemand {
    elec_demand: Matrix,
    elec_supply: Matrix,
    high_heat_demand: Matrix,
    high_heat_supply: Matrix,
    low_heat_demand: Matrix,
    low_heat_supply: Matrix,
    cooling_demand: Matrix,
    cooling_supply: Matrix,
}

impl SupplyAndDemand {
    fn with_capacity(n: usize) -> Self {
        Self {
            elec_demand: Vec::with_capacity(n),
            elec_supply: Vec::with_capacity(n),
            high_heat_demand: Vec::with_capacity(n),
            high_heat_supply: Vec::with_capacity(n),
            low_heat_demand: Vec::with_capacity(n),
            low_heat_supply: Vec::with_capacity(n),
            cooling_demand: Vec::with_capacity(n),
            cooling_supply: Vec::with_capacity(n),
        }
    }

    /// Splits an agent's net use into demand (positive net use) and supply
    /// (absolute value of negative net use) per resource and hour.
    fn push_agent(&mut self, agent: &BlockAgent, periods: &[DateTime<Utc>]) {
        let mut split = |resource: Resource| -> (Vec<f64>, Vec<f64>) {
            periods
                .iter()
                .map(|&period| {
                    let net = agent.digital_twin.net_use(period, resource);
                    if net > 0.0 {
                        (net, 0.0)
                    } else {
                        (0.0, -net)
                    }
                })
                .unzip()
        };
        let (demand, supply) = split(Resource::Electricity);
        self.elec_demand.push(demand);
        self.elec_supply.push(supply);
        let (demand, supply) = split(Resource::HighTempHeat);
        self.high_heat_demand.push(demand);
        self.high_heat_supply.push(supply);
        let (demand, supply) = split(Resource::LowTempHeat);
        self.low_heat_demand.push(demand);
        self.low_heat_supply.push(supply);
        let (demand, supply) = split(Resource::Cooling);
        self.cooling_demand.push(demand);
        self.cooling_supply.push(supply);
    }
}

/// Every registered series must cover the whole horizon.
fn check_series_cover_horizon(
    agents: &[BlockAgent],
    periods: &[DateTime<Utc>],
) -> Result<(), SimulationError> {
    let mut offenders = Vec::new();
    for agent in agents {
        if let Some(len) = agent.digital_twin.series_len() {
            if len < periods.len() {
                offenders.push(agent.guid.clone());
            }
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(UnfillableDemand { agent_guids: offenders, hours: vec![] }.into())
    }
}

/// Hot water is served from the accumulator tank, so a tank owner's hourly
/// hot-water demand can never exceed what the tank can discharge plus take
/// in within the hour.
fn check_hot_water_fillable(inputs: &HorizonInputs) -> Result<(), SimulationError> {
    let mut offenders: BTreeSet<usize> = BTreeSet::new();
    let mut hours: BTreeSet<usize> = BTreeSet::new();
    for (i, per_deg) in inputs.acc_tank_kwh_per_deg.iter().enumerate() {
        if *per_deg == 0.0 {
            continue;
        }
        // Tank capacity plus what can be recharged within the hour
        let max_discharge = 2.0 * per_deg * inputs.acc_tank_max_temp;
        for (t, demand) in inputs.high_heat_demand[i].iter().enumerate() {
            if *demand > max_discharge {
                offenders.insert(i);
                hours.insert(t);
            }
        }
    }
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(UnfillableDemand {
            agent_guids: offenders
                .into_iter()
                .map(|i| inputs.agent_guids[i].clone())
                .collect(),
            hours: hours.into_iter().collect(),
        }
        .into())
    }
}

/// The community's hourly cooling demand must be chillable: the compressor
/// chiller plus every cooling-capable heat pump at full tilt. A borehole
/// provides unlimited free cooling outside June-August.
fn check_cooling_fillable(inputs: &HorizonInputs) -> Result<(), SimulationError> {
    let free_cooling = !is_summer_month(inputs.month)
        && inputs.borehole.iter().any(|&has_borehole| has_borehole);
    if free_cooling {
        return Ok(());
    }
    let hp_cooling: f64 = (0..inputs.n_agents())
        .filter(|&i| inputs.hp_produce_cooling[i])
        .map(|i| (inputs.heat_pump_cop - 1.0) * inputs.heatpump_max_power[i])
        .sum();
    let max_chillable = inputs.chiller_max_input * inputs.chiller_cop + hp_cooling;
    let mut hours = Vec::new();
    for t in 0..inputs.horizon {
        let community_demand: f64 = (0..inputs.n_agents())
            .map(|i| inputs.cooling_demand[i][t])
            .sum();
        if community_demand > max_chillable {
            hours.push(t);
        }
    }
    if hours.is_empty() {
        Ok(())
    } else {
        Err(UnfillableDemand { agent_guids: inputs.agent_guids.clone(), hours }.into())
    }
}
