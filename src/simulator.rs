//! The simulation driver: builds the community from a scenario, walks the
//! timeline horizon by horizon, threads the building-inertia state between
//! horizons, persists the results in batches, and runs the monthly tariff
//! reconciliation once the year is done.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::config::{ScenarioConfig, SimulationConfig};
use crate::db::{
    ElectricityPriceRow, ExtraCostRow, HeatingPriceRow, JobRow, LevelRow, Persistence, TradeRow,
};
use crate::domain::{
    energy_to_water_volume, hourly_range, solar_production, AgentType, Battery, BlockAgent,
    GridAgent, HourlySeries, Resource, StaticDigitalTwin, Trade, YearMonth, ACC_TANK_TEMPERATURE,
};
use crate::error::{ConfigError, SimulationError};
use crate::horizon::assemble_horizon;
use crate::mock_data::{generate_input_series, generate_mock_data, mock_data_seed};
use crate::optimizer::{optimize, MetadataPerAgent, MetadataPerPeriod, OptimizerOutputs};
use crate::pricing::{electricity::InternalTariff, ElectricityPrice, HeatingPrice};
use crate::settlement::{electricity_cost_corrections, heating_cost_corrections};

/// Whether the community may export heat to the district network. The
/// current networks do not accept building-side exports.
const LEC_CAN_SELL_HEAT_TO_EXTERNAL: bool = false;

pub struct TradingSimulator {
    job_id: String,
    scenario: ScenarioConfig,
    simulation: SimulationConfig,
    store: Arc<dyn Persistence>,
    cancel: CancellationToken,
    agents: Vec<BlockAgent>,
    elec_grid: GridAgent,
    heat_grid: GridAgent,
    elec_pricing: ElectricityPrice,
    heat_pricing: HeatingPrice,
    trading_periods: Vec<DateTime<Utc>>,
}

impl TradingSimulator {
    pub fn new(
        job_id: &str,
        scenario: ScenarioConfig,
        simulation: SimulationConfig,
        store: Arc<dyn Persistence>,
        cancel: CancellationToken,
    ) -> Result<Self, SimulationError> {
        scenario.validate_semantics()?;
        let trading_periods =
            hourly_range(simulation.start, simulation.days as usize * 24);

        let seed = mock_data_seed(&scenario.agents, &scenario.mock_data_constants);
        let inputs = generate_input_series(&trading_periods, seed);
        let mock_data =
            generate_mock_data(&scenario.agents, &scenario.mock_data_constants, &trading_periods);

        let area_info = &scenario.area_info;
        let mut agents = Vec::new();
        let mut elec_grid = None;
        let mut heat_grid = None;
        for spec in &scenario.agents {
            match spec.parsed_type()? {
                AgentType::GridAgent => {
                    let resource = spec.parsed_resource()?;
                    let grid = GridAgent {
                        guid: spec.name.clone(),
                        resource,
                        max_transfer_per_hour: spec.transfer_rate.unwrap_or(10_000.0),
                        can_buy: match resource {
                            Resource::Electricity => true,
                            _ => LEC_CAN_SELL_HEAT_TO_EXTERNAL,
                        },
                    };
                    match resource {
                        Resource::Electricity => elec_grid = Some(grid),
                        _ => heat_grid = Some(grid),
                    }
                }
                AgentType::BlockAgent | AgentType::GroceryStoreAgent => {
                    let series = mock_data.get(&spec.name).cloned().unwrap_or_default();
                    let pv_efficiency = spec.pv_efficiency.unwrap_or(area_info.pv_efficiency);
                    let pv_production: HourlySeries = inputs
                        .irradiation
                        .iter()
                        .map(|(&period, &irradiation)| {
                            (period, solar_production(irradiation, spec.pv_area, pv_efficiency))
                        })
                        .collect();
                    let mut twin = StaticDigitalTwin::new(
                        spec.gross_floor_area,
                        spec.heat_pump_for_cooling,
                    )
                    .with_consumption(Resource::Electricity, series.elec_cons)
                    .with_consumption(Resource::LowTempHeat, series.space_heat_cons)
                    .with_consumption(Resource::HighTempHeat, series.hot_water_cons)
                    .with_consumption(Resource::Cooling, series.cooling_cons)
                    .with_production(Resource::Electricity, pv_production);
                    if spec.sell_excess_heat {
                        twin = twin.with_production(Resource::LowTempHeat, series.excess_heat_prod);
                    }
                    agents.push(BlockAgent {
                        guid: spec.name.clone(),
                        digital_twin: twin,
                        battery: Battery::new(
                            spec.battery_capacity,
                            area_info.battery_charge_rate,
                            area_info.battery_discharge_rate,
                            area_info.battery_efficiency,
                        ),
                        heat_pump_max_input: spec.heat_pump_max_input,
                        heat_pump_max_output: spec.heat_pump_max_output,
                        booster_pump_max_input: spec.booster_pump_max_input,
                        booster_pump_max_output: spec.booster_pump_max_output,
                        acc_tank_volume: energy_to_water_volume(
                            spec.accumulator_tank_capacity,
                            ACC_TANK_TEMPERATURE,
                        ),
                        frac_for_bites: spec.fraction_used_for_bites,
                        has_borehole: spec.borehole,
                    });
                }
                AgentType::HeatProducerAgent => {
                    let production: HourlySeries = trading_periods
                        .iter()
                        .map(|&period| (period, spec.heat_production))
                        .collect();
                    let twin = StaticDigitalTwin::new(spec.gross_floor_area, false)
                        .with_production(Resource::HighTempHeat, production);
                    agents.push(BlockAgent {
                        guid: spec.name.clone(),
                        digital_twin: twin,
                        battery: Battery::none(),
                        heat_pump_max_input: 0.0,
                        heat_pump_max_output: 0.0,
                        booster_pump_max_input: 0.0,
                        booster_pump_max_output: 0.0,
                        acc_tank_volume: 0.0,
                        frac_for_bites: 0.0,
                        has_borehole: false,
                    });
                }
            }
        }
        let elec_grid = elec_grid.ok_or(ConfigError::NoGridAgentForResource(
            Resource::Electricity.to_string(),
        ))?;
        let heat_grid = heat_grid.ok_or(ConfigError::NoGridAgentForResource(
            Resource::HighTempHeat.to_string(),
        ))?;

        let elec_pricing = ElectricityPrice::new(
            inputs.nordpool_price,
            area_info.electricity_tax,
            area_info.electricity_grid_fee,
            InternalTariff {
                tax: area_info.electricity_tax_internal,
                grid_fee: area_info.electricity_grid_fee_internal,
            },
            area_info.external_electricity_wholesale_price_offset,
            area_info.electricity_effect_fee,
        );
        let heat_pricing = HeatingPrice::new(
            area_info.external_heating_wholesale_price_fraction,
            area_info.heating_effect_fee,
        );

        Ok(Self {
            job_id: job_id.to_string(),
            scenario,
            simulation,
            store,
            cancel,
            agents,
            elec_grid,
            heat_grid,
            elec_pricing,
            heat_pricing,
            trading_periods,
        })
    }

    /// Runs the full simulation: all horizons, then settlement.
    pub async fn run(mut self) -> Result<(), SimulationError> {
        let horizon = self.scenario.area_info.trading_horizon;
        let horizon_starts: Vec<DateTime<Utc>> = self
            .trading_periods
            .chunks(horizon)
            .filter(|chunk| chunk.len() == horizon)
            .map(|chunk| chunk[0])
            .collect();
        let number_of_horizons = horizon_starts.len();
        info!(
            job_id = %self.job_id,
            horizons = number_of_horizons,
            "starting trading simulation"
        );
        let batch_size = number_of_horizons.div_ceil(self.simulation.number_of_batches);

        let mut shallow_storage: HashMap<String, f64> = HashMap::new();
        let mut deep_storage: HashMap<String, f64> = HashMap::new();
        let mut all_trades: Vec<Trade> = Vec::new();
        let mut metadata_per_agent: MetadataPerAgent = HashMap::new();
        let mut metadata_per_period: MetadataPerPeriod = HashMap::new();

        for (batch_number, batch) in horizon_starts.chunks(batch_size.max(1)).enumerate() {
            info!(batch = batch_number + 1, "simulating batch");
            let mut batch_trades: Vec<Trade> = Vec::new();
            for &horizon_start in batch {
                if self.cancel.is_cancelled() {
                    warn!("simulation stopped by cancellation request");
                    return Err(SimulationError::Stopped);
                }
                let span = info_span!("horizon", start = %horizon_start);
                let _entered = span.enter();

                let inputs = assemble_horizon(
                    &self.agents,
                    &self.elec_grid,
                    &self.heat_grid,
                    &self.scenario.area_info,
                    &self.elec_pricing,
                    &self.heat_pricing,
                    horizon_start,
                    &shallow_storage,
                    &deep_storage,
                )?;
                let outputs = optimize(
                    &inputs,
                    self.scenario.area_info.local_market_enabled,
                    &self.elec_grid.guid,
                    &self.heat_grid.guid,
                    &mut self.elec_pricing,
                    &mut self.heat_pricing,
                )?;
                shallow_storage.extend(outputs.shallow_storage_end.clone());
                deep_storage.extend(outputs.deep_storage_end.clone());
                merge_metadata(&mut metadata_per_agent, &mut metadata_per_period, &outputs);
                batch_trades.extend(outputs.trades);
            }
            let rows: Vec<TradeRow> = batch_trades
                .iter()
                .map(|trade| TradeRow::from_trade(&self.job_id, trade))
                .collect();
            info!(trades = rows.len(), "saving batch trades");
            self.store.insert_trades(rows).await?;
            all_trades.extend(batch_trades);
        }

        self.persist_levels(&metadata_per_agent, &metadata_per_period).await?;
        self.settle(&all_trades).await?;
        info!(job_id = %self.job_id, "simulation finished");
        Ok(())
    }

    async fn persist_levels(
        &self,
        metadata_per_agent: &MetadataPerAgent,
        metadata_per_period: &MetadataPerPeriod,
    ) -> Result<(), SimulationError> {
        let mut rows: Vec<LevelRow> = Vec::new();
        for (&key, per_agent) in metadata_per_agent {
            for (agent, series) in per_agent {
                for (&period, &value) in series {
                    rows.push(LevelRow::new(
                        &self.job_id,
                        period,
                        Some(agent.as_str()),
                        key,
                        value,
                    ));
                }
            }
        }
        for (&key, series) in metadata_per_period {
            for (&period, &value) in series {
                rows.push(LevelRow::new(&self.job_id, period, None, key, value));
            }
        }
        info!(levels = rows.len(), "saving level series");
        self.store.insert_levels(rows).await?;
        Ok(())
    }

    /// Monthly tariff reconciliation: exact prices from the accumulated
    /// observations, price rows for both resources, and the extra-cost
    /// corrections attributed to agents.
    async fn settle(&self, all_trades: &[Trade]) -> Result<(), SimulationError> {
        info!("calculating exact prices and corrections");
        let months: BTreeSet<YearMonth> =
            self.trading_periods.iter().map(|&p| YearMonth::of(p)).collect();

        let mut heat_exact_retail = HashMap::new();
        let mut heat_exact_wholesale = HashMap::new();
        let mut heating_rows = Vec::new();
        for &month in &months {
            let exact_retail = self.heat_pricing.exact_retail_price(month, None);
            let exact_wholesale = self.heat_pricing.exact_wholesale_price(month, None);
            heat_exact_retail.insert(month, exact_retail);
            heat_exact_wholesale.insert(month, exact_wholesale);
            heating_rows.push(HeatingPriceRow {
                job_id: self.job_id.clone(),
                year: month.year,
                month: month.month,
                exact_retail,
                exact_wholesale,
                estimated_retail: self.heat_pricing.observations.mean_estimate_for_month(month),
                estimated_wholesale: self
                    .heat_pricing
                    .observations
                    .mean_estimate_for_month(month)
                    .map(|estimate| estimate * self.heat_pricing.wholesale_price_fraction),
            });
        }
        self.store.insert_heating_prices(heating_rows).await?;

        let mut elec_exact_retail: BTreeMap<DateTime<Utc>, Option<f64>> = BTreeMap::new();
        let mut electricity_rows = Vec::new();
        for &period in &self.trading_periods {
            let exact_retail = self
                .elec_pricing
                .exact_retail_price(period, None)
                .map_err(SimulationError::Config)?;
            let exact_wholesale = self
                .elec_pricing
                .exact_wholesale_price(period)
                .map_err(SimulationError::Config)?;
            elec_exact_retail.insert(period, exact_retail);
            electricity_rows.push(ElectricityPriceRow {
                job_id: self.job_id.clone(),
                period,
                exact_retail,
                exact_wholesale: Some(exact_wholesale),
                estimated_retail: self.elec_pricing.observations.price_estimate(period),
                estimated_wholesale: Some(exact_wholesale),
            });
        }
        self.store.insert_electricity_prices(electricity_rows).await?;

        let mut corrections = heating_cost_corrections(
            all_trades,
            &heat_exact_retail,
            &heat_exact_wholesale,
            &self.heat_grid.guid,
        );
        corrections.extend(electricity_cost_corrections(
            all_trades,
            &elec_exact_retail,
            &self.elec_grid.guid,
        ));
        info!(corrections = corrections.len(), "saving extra costs");
        let rows: Vec<ExtraCostRow> = corrections
            .iter()
            .map(|cost| ExtraCostRow::from_extra_cost(&self.job_id, cost))
            .collect();
        self.store.insert_extra_costs(rows).await?;
        Ok(())
    }
}

fn merge_metadata(
    metadata_per_agent: &mut MetadataPerAgent,
    metadata_per_period: &mut MetadataPerPeriod,
    outputs: &OptimizerOutputs,
) {
    for (&key, per_agent) in &outputs.metadata_per_agent {
        let target = metadata_per_agent.entry(key).or_default();
        for (agent, series) in per_agent {
            target
                .entry(agent.clone())
                .or_default()
                .extend(series.iter().map(|(&period, &value)| (period, value)));
        }
    }
    for (&key, series) in &outputs.metadata_per_period {
        metadata_per_period
            .entry(key)
            .or_default()
            .extend(series.iter().map(|(&period, &value)| (period, value)));
    }
}

/// Runs one job end to end with the lifecycle bookkeeping the CLI expects:
/// job row creation, start/end stamps, failure info, and cleanup of partial
/// data on errors.
pub async fn run_job(
    job_id: &str,
    config_id: &str,
    scenario: ScenarioConfig,
    simulation: SimulationConfig,
    store: Arc<dyn Persistence>,
    cancel: CancellationToken,
) -> Result<(), SimulationError> {
    store.create_job(JobRow::new(job_id, config_id)).await?;
    store.update_job_started(job_id, Utc::now()).await?;

    let simulator =
        match TradingSimulator::new(job_id, scenario, simulation, store.clone(), cancel) {
            Ok(simulator) => simulator,
            Err(e) => {
                let _ = store.update_job_failed(job_id, &e.to_string()).await;
                return Err(e);
            }
        };
    match simulator.run().await {
        Ok(()) => {
            store.update_job_finished(job_id, Utc::now()).await?;
            Ok(())
        }
        Err(SimulationError::Stopped) => {
            // A cancelled job leaves no trace
            let _ = store.delete_job(job_id).await;
            Err(SimulationError::Stopped)
        }
        Err(e) => {
            error!(job_id, error = %e, "job failed, removing partial data");
            let _ = store.update_job_failed(job_id, &e.to_string()).await;
            let _ = store.delete_job_data(job_id).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSpec, AreaInfo, MockDataConstants};
    use crate::db::InMemoryStore;

    fn scenario() -> ScenarioConfig {
        ScenarioConfig {
            area_info: AreaInfo::default(),
            agents: vec![
                AgentSpec {
                    name: "Block1".into(),
                    agent_type: "BlockAgent".into(),
                    gross_floor_area: 5_000.0,
                    pv_area: 200.0,
                    heat_pump_max_input: 100.0,
                    heat_pump_max_output: 280.0,
                    accumulator_tank_capacity: 200.0,
                    battery_capacity: 100.0,
                    fraction_used_for_bites: 0.5,
                    ..Default::default()
                },
                AgentSpec {
                    name: "ElecGrid".into(),
                    agent_type: "GridAgent".into(),
                    resource: Some("ELECTRICITY".into()),
                    transfer_rate: Some(10_000.0),
                    ..Default::default()
                },
                AgentSpec {
                    name: "HeatGrid".into(),
                    agent_type: "GridAgent".into(),
                    resource: Some("HIGH_TEMP_HEAT".into()),
                    transfer_rate: Some(10_000.0),
                    ..Default::default()
                },
            ],
            mock_data_constants: MockDataConstants::default(),
        }
    }

    #[test]
    fn test_simulator_construction() {
        let store = Arc::new(InMemoryStore::new());
        let simulation = SimulationConfig { days: 2, ..Default::default() };
        let simulator = TradingSimulator::new(
            "job",
            scenario(),
            simulation,
            store,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(simulator.agents.len(), 1);
        assert_eq!(simulator.trading_periods.len(), 48);
        assert_eq!(simulator.elec_grid.guid, "ElecGrid");
        assert!(!simulator.heat_grid.can_buy);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_horizon() {
        let store = Arc::new(InMemoryStore::new());
        let simulation = SimulationConfig { days: 1, ..Default::default() };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let simulator =
            TradingSimulator::new("job", scenario(), simulation, store, cancel).unwrap();
        assert!(matches!(simulator.run().await, Err(SimulationError::Stopped)));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_deleted() {
        let store = Arc::new(InMemoryStore::new());
        let simulation = SimulationConfig { days: 1, ..Default::default() };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_job(
            "job",
            "config",
            scenario(),
            simulation,
            store.clone(),
            cancel,
        )
        .await;
        assert!(matches!(result, Err(SimulationError::Stopped)));
        assert!(store.job("job").is_none());
    }
}
