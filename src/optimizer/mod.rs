//! MILP construction, solving and primal extraction for one horizon.

pub mod agent_ems;
pub mod cems;
mod common;
pub mod extract;
pub mod params;

pub use params::Param;

use chrono::{DateTime, Duration, Utc};
use good_lp::ResolutionError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error};

use crate::domain::{Trade, TradeMetadataKey};
use crate::error::InfeasibilityError;
use crate::horizon::HorizonInputs;
use crate::pricing::{ElectricityPrice, HeatingPrice};

/// Per-agent time series keyed by metadata kind, then agent, then period.
pub type MetadataPerAgent =
    HashMap<TradeMetadataKey, HashMap<String, BTreeMap<DateTime<Utc>, f64>>>;
/// Community-wide time series keyed by metadata kind, then period.
pub type MetadataPerPeriod = HashMap<TradeMetadataKey, BTreeMap<DateTime<Utc>, f64>>;

/// Everything the driver takes away from one solved horizon.
#[derive(Debug, Clone, Default)]
pub struct OptimizerOutputs {
    pub trades: Vec<Trade>,
    pub metadata_per_agent: MetadataPerAgent,
    pub metadata_per_period: MetadataPerPeriod,
    /// Final-hour building-inertia contents, handed to the next horizon.
    pub shallow_storage_end: HashMap<String, f64>,
    pub deep_storage_end: HashMap<String, f64>,
}

/// Maps a solver failure onto the infeasibility taxonomy. The CBC binding
/// cannot name the violated constraints, so the set is empty; any
/// non-optimal termination is treated as infeasible.
pub(crate) fn infeasible(
    start: DateTime<Utc>,
    horizon: usize,
    agent_guids: &[String],
    err: ResolutionError,
) -> InfeasibilityError {
    error!(%start, ?err, "solver terminated without an optimal solution");
    InfeasibilityError {
        agent_guids: agent_guids.to_vec(),
        horizon_start: start,
        horizon_end: start + Duration::hours(horizon as i64),
        constraint_names: BTreeSet::new(),
    }
}

/// Solves one horizon and translates the primal back into the trading
/// domain. With the internal market enabled this is one joint model over all
/// agents; without it, one model per agent against the external tariffs.
pub fn optimize(
    inputs: &HorizonInputs,
    local_market_enabled: bool,
    elec_grid_guid: &str,
    heat_grid_guid: &str,
    elec_pricing: &mut ElectricityPrice,
    heat_pricing: &mut HeatingPrice,
) -> Result<OptimizerOutputs, InfeasibilityError> {
    if local_market_enabled {
        debug!(start = %inputs.start, agents = inputs.n_agents(), "solving community model");
        let primal = cems::solve_cems(inputs)?;
        Ok(extract::extract_cems_outputs(
            &primal,
            inputs,
            elec_grid_guid,
            heat_grid_guid,
            elec_pricing,
            heat_pricing,
        ))
    } else {
        debug!(start = %inputs.start, agents = inputs.n_agents(), "solving standalone agent models");
        let mut outputs = OptimizerOutputs::default();
        for i in 0..inputs.n_agents() {
            let guid = &inputs.agent_guids[i];
            let hist_top_three = elec_pricing.top_three_hourly_outtakes(inputs.start, Some(guid));
            let hist_heat_peak = heat_pricing.avg_peak_for_month(inputs.start, Some(guid));
            let primal = agent_ems::solve_agent_ems(inputs, i, hist_top_three, hist_heat_peak)?;
            extract::extract_agent_outputs(
                &primal,
                inputs,
                i,
                elec_grid_guid,
                heat_grid_guid,
                elec_pricing,
                heat_pricing,
                &mut outputs,
            );
        }
        extract::aggregate_external_trades(&mut outputs);
        extract::aggregate_agent_dumps(&mut outputs);
        Ok(outputs)
    }
}
