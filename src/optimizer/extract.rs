//! Translating a solved model's primal back into the trading domain:
//! per-agent trades, external grid trades, per-kWh price reconstruction, and
//! the metadata level series.
//!
//! The objective prices external electricity with a peak variable rather
//! than a per-kWh fee, so the retail price the trades show is recovered by
//! inverting that term: the horizon's total effect fee, spread over the kWh
//! bought in the horizon.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::agent_ems::AgentPrimal;
use super::cems::CemsPrimal;
use super::{OptimizerOutputs, Param};
use crate::domain::{
    round_to_decimals, Action, BitesParameters, Market, Resource, Trade, TradeMetadataKey,
    VERY_SMALL_NUMBER,
};
use crate::horizon::HorizonInputs;
use crate::pricing::{ElectricityPrice, HeatingPrice};

/// The objective's price coefficients, as scalars or per-hour series. Price
/// reconstruction reads them through one accessor regardless of shape.
struct TariffParams {
    nordpool: Param,
    trans_fee: Param,
    tax: Param,
    elec_peak_fee: Param,
    heat_price: Param,
    heat_peak_fee: Param,
    incentive_fee: Param,
}

impl TariffParams {
    fn from_inputs(inputs: &HorizonInputs) -> Self {
        Self {
            nordpool: Param::from(inputs.nordpool_price.clone()),
            trans_fee: Param::from(inputs.elec_trans_fee),
            tax: Param::from(inputs.elec_tax_fee),
            elec_peak_fee: Param::from(inputs.elec_peak_load_fee),
            heat_price: Param::from(inputs.heat_retail_price),
            heat_peak_fee: Param::from(inputs.heat_peak_load_fee),
            incentive_fee: Param::from(inputs.incentive_fee),
        }
    }
}

/// Reconstructed per-kWh electricity retail price for one hour, with its
/// components: the tax and the share that goes to the grid operator.
struct ElecRetail {
    price: f64,
    tax: f64,
    grid_fee: f64,
}

/// `price = spot + transmission + tax + effect_fee_share`, where the share is
/// the horizon's total effect fee spread over all kWh bought in the horizon.
fn reconstruct_elec_retail(
    params: &TariffParams,
    t: usize,
    avg_elec_peak_load: f64,
    total_bought: f64,
) -> ElecRetail {
    let tax = params.tax.at(t);
    let trans_fee = params.trans_fee.at(t);
    let total_effect_fee = params.elec_peak_fee.at(t) * avg_elec_peak_load;
    let effect_fee_per_kwh =
        if total_bought > 0.0 { total_effect_fee / total_bought } else { 0.0 };
    ElecRetail {
        price: params.nordpool.at(t) + trans_fee + tax + effect_fee_per_kwh,
        tax,
        grid_fee: effect_fee_per_kwh + trans_fee,
    }
}

fn reconstruct_elec_wholesale(params: &TariffParams, t: usize) -> f64 {
    params.nordpool.at(t) + params.incentive_fee.at(t)
}

/// Heat analog; one scalar for the whole horizon.
fn reconstruct_heat_retail(
    params: &TariffParams,
    monthly_heat_peak_energy: f64,
    total_bought: f64,
) -> f64 {
    let total_effect_fee = (params.heat_peak_fee.at(0) / 24.0) * monthly_heat_peak_energy;
    let effect_fee_per_kwh =
        if total_bought > 0.0 { total_effect_fee / total_bought } else { 0.0 };
    params.heat_price.at(0) + effect_fee_per_kwh
}

/// Selling heat back to the district network is not defined, so heat sell
/// trades carry no price.
fn heat_wholesale() -> Option<f64> {
    None
}

pub fn extract_cems_outputs(
    primal: &CemsPrimal,
    inputs: &HorizonInputs,
    elec_grid_guid: &str,
    heat_grid_guid: &str,
    elec_pricing: &mut ElectricityPrice,
    heat_pricing: &mut HeatingPrice,
) -> OptimizerOutputs {
    let mut outputs = OptimizerOutputs::default();
    let periods = inputs.periods();
    let n = inputs.n_agents();
    let params = TariffParams::from_inputs(inputs);
    let total_elec_bought: f64 = primal.p_buy_market.iter().sum();
    let total_heat_bought: f64 = primal.h_buy_market.iter().sum();
    let heat_retail =
        reconstruct_heat_retail(&params, primal.monthly_heat_peak_energy, total_heat_bought);
    // In summer the internal heat bus runs at low temperature
    let internal_heat_resource =
        if inputs.summer_mode { Resource::LowTempHeat } else { Resource::HighTempHeat };

    for (t, &period) in periods.iter().enumerate() {
        let retail =
            reconstruct_elec_retail(&params, t, primal.avg_elec_peak_load, total_elec_bought);
        let wholesale = reconstruct_elec_wholesale(&params, t);

        // Internal electricity trades
        for i in 0..n {
            let net = primal.p_buy_grid[i][t] - primal.p_sell_grid[i][t];
            let action = if net > 0.0 { Action::Buy } else { Action::Sell };
            let price = if net > 0.0 { retail.price } else { wholesale };
            if let Some(trade) = Trade::from_net_quantity(
                period,
                &inputs.agent_guids[i],
                action,
                Resource::Electricity,
                net,
                Some(price),
                false,
                Market::Local,
                0.0,
            ) {
                if action == Action::Buy {
                    elec_pricing.observations.add_price_estimate_for_agent(
                        period,
                        retail.price,
                        &inputs.agent_guids[i],
                    );
                    // Internally sourced energy carries the community's own
                    // tax and grid fee recognition
                    let internal = elec_pricing.internal;
                    outputs
                        .trades
                        .push(trade.with_fees(internal.grid_fee, internal.tax));
                } else {
                    outputs.trades.push(trade);
                }
            }
        }

        // The external electricity trade, from the grid operator's side
        let external_net = primal.p_sell_market[t] - primal.p_buy_market[t];
        if external_net > VERY_SMALL_NUMBER {
            // The community exported; the operator buys at wholesale
            if let Some(trade) = Trade::from_net_quantity(
                period,
                elec_grid_guid,
                Action::Buy,
                Resource::Electricity,
                external_net,
                Some(wholesale),
                true,
                Market::Local,
                0.0,
            ) {
                outputs.trades.push(trade);
            }
            elec_pricing.observations.add_external_sell(period, 0.0);
        } else {
            let sold = (-external_net).max(0.0);
            if let Some(trade) = Trade::from_net_quantity(
                period,
                elec_grid_guid,
                Action::Sell,
                Resource::Electricity,
                sold,
                Some(retail.price),
                true,
                Market::Local,
                0.0,
            ) {
                elec_pricing.observations.add_price_estimate(period, retail.price);
                outputs
                    .trades
                    .push(trade.with_fees(retail.grid_fee, retail.tax));
            }
            elec_pricing
                .observations
                .add_external_sell(period, if sold > VERY_SMALL_NUMBER { sold } else { 0.0 });
        }

        // Internal heat trades
        for i in 0..n {
            let net = primal.h_buy_grid[i][t] - primal.h_sell_grid[i][t];
            let action = if net > 0.0 { Action::Buy } else { Action::Sell };
            let price = if net > 0.0 { Some(heat_retail) } else { heat_wholesale() };
            if let Some(trade) = Trade::from_net_quantity(
                period,
                &inputs.agent_guids[i],
                action,
                internal_heat_resource,
                net,
                price,
                false,
                Market::Local,
                inputs.heat_trans_loss,
            ) {
                if action == Action::Buy {
                    heat_pricing.observations.add_price_estimate_for_agent(
                        period,
                        heat_retail,
                        &inputs.agent_guids[i],
                    );
                }
                outputs.trades.push(trade);
            }
        }

        // The external heat trade; the district network only sells
        let heat_sold = primal.h_buy_market[t];
        if let Some(trade) = Trade::from_net_quantity(
            period,
            heat_grid_guid,
            Action::Sell,
            Resource::HighTempHeat,
            heat_sold,
            Some(heat_retail),
            true,
            Market::Local,
            inputs.heat_trans_loss,
        ) {
            heat_pricing.observations.add_price_estimate(period, heat_retail);
            outputs.trades.push(trade);
        }
        heat_pricing
            .observations
            .add_external_sell(period, if heat_sold > VERY_SMALL_NUMBER { heat_sold } else { 0.0 });

        // Cooling trades between agents; no external market and no price
        for i in 0..n {
            let net = primal.c_buy_grid[i][t] - primal.c_sell_grid[i][t];
            let action = if net > 0.0 { Action::Buy } else { Action::Sell };
            if let Some(trade) = Trade::from_net_quantity(
                period,
                &inputs.agent_guids[i],
                action,
                Resource::Cooling,
                net,
                None,
                false,
                Market::Local,
                inputs.cold_trans_loss,
            ) {
                outputs.trades.push(trade);
            }
        }
    }

    collect_cems_metadata(primal, inputs, &periods, &mut outputs);

    for i in 0..n {
        let guid = inputs.agent_guids[i].clone();
        outputs
            .shallow_storage_end
            .insert(guid.clone(), primal.energy_shallow[i][inputs.horizon - 1]);
        outputs
            .deep_storage_end
            .insert(guid, primal.energy_deep[i][inputs.horizon - 1]);
    }
    outputs
}

/// Copies the level series out of the primal, filtered to agents that own
/// the device in question and rounded for persistence.
fn collect_cems_metadata(
    primal: &CemsPrimal,
    inputs: &HorizonInputs,
    periods: &[DateTime<Utc>],
    outputs: &mut OptimizerOutputs,
) {
    let n = inputs.n_agents();
    let bites: Vec<BitesParameters> =
        inputs.bites_area.iter().map(|&a| BitesParameters::for_area(a)).collect();

    let mut add_per_agent = |key: TradeMetadataKey,
                             values: &Vec<Vec<f64>>,
                             keep: &dyn Fn(usize) -> bool,
                             divide_by: &dyn Fn(usize) -> f64| {
        let mut per_agent: std::collections::HashMap<String, BTreeMap<DateTime<Utc>, f64>> =
            Default::default();
        for i in 0..n {
            if !keep(i) {
                continue;
            }
            let series: BTreeMap<DateTime<Utc>, f64> = periods
                .iter()
                .enumerate()
                .map(|(t, &p)| (p, round_to_decimals(values[i][t] / divide_by(i))))
                .collect();
            per_agent.insert(inputs.agent_guids[i].clone(), series);
        }
        outputs.metadata_per_agent.insert(key, per_agent);
    };

    let one = |_: usize| 1.0;
    let has_battery = |i: usize| inputs.battery_capacity[i] > 0.0;
    let has_tank = |i: usize| inputs.acc_tank_kwh_per_deg[i] > 0.0;
    let has_shallow = {
        let bites = bites.clone();
        move |i: usize| bites[i].shallow_capacity_kwh > 0.0
    };
    let has_deep = {
        let bites = bites.clone();
        move |i: usize| bites[i].deep_capacity_kwh > 0.0
    };
    let has_hp = |i: usize| inputs.heatpump_max_power[i] > 0.0;
    let has_booster = |i: usize| inputs.booster_max_power[i] > 0.0;

    add_per_agent(TradeMetadataKey::BatteryLevel, &primal.soc_bes, &has_battery, &one);
    add_per_agent(TradeMetadataKey::AccTankLevel, &primal.soc_tes, &has_tank, &one);
    {
        let caps = bites.clone();
        add_per_agent(
            TradeMetadataKey::ShallowStorageRel,
            &primal.energy_shallow,
            &has_shallow,
            &move |i| caps[i].shallow_capacity_kwh,
        );
    }
    add_per_agent(TradeMetadataKey::ShallowStorageAbs, &primal.energy_shallow, &has_shallow, &one);
    {
        let caps = bites.clone();
        add_per_agent(
            TradeMetadataKey::DeepStorageRel,
            &primal.energy_deep,
            &has_deep,
            &move |i| caps[i].deep_capacity_kwh,
        );
    }
    add_per_agent(TradeMetadataKey::DeepStorageAbs, &primal.energy_deep, &has_deep, &one);
    add_per_agent(TradeMetadataKey::ShallowLoss, &primal.loss_shallow, &has_shallow, &one);
    add_per_agent(TradeMetadataKey::DeepLoss, &primal.loss_deep, &has_deep, &one);
    add_per_agent(TradeMetadataKey::ShallowCharge, &primal.h_cha_shallow, &has_shallow, &one);
    add_per_agent(TradeMetadataKey::FlowShallowToDeep, &primal.flow, &has_deep, &one);
    add_per_agent(TradeMetadataKey::HpCoolProd, &primal.c_hp, &has_hp, &one);
    if let Some(h_hp_b) = &primal.h_hp_b {
        // Summer: the main pump produces low-temperature heat, the booster
        // covers the high-temperature demand
        add_per_agent(TradeMetadataKey::HpLowHeatProd, &primal.h_hp, &has_hp, &one);
        add_per_agent(TradeMetadataKey::HpHighHeatProd, h_hp_b, &has_booster, &one);
    } else {
        let nobody = |_: usize| false;
        add_per_agent(TradeMetadataKey::HpLowHeatProd, &primal.h_hp, &nobody, &one);
        add_per_agent(TradeMetadataKey::HpHighHeatProd, &primal.h_hp, &has_hp, &one);
    }

    // Community-wide series
    let per_period = |values: &Vec<f64>| -> BTreeMap<DateTime<Utc>, f64> {
        periods
            .iter()
            .enumerate()
            .map(|(t, &p)| (p, round_to_decimals(values[t])))
            .collect()
    };
    let sum_over_agents = |values: &Vec<Vec<f64>>| -> BTreeMap<DateTime<Utc>, f64> {
        periods
            .iter()
            .enumerate()
            .map(|(t, &p)| {
                let total: f64 = (0..n).map(|i| values[i][t]).sum();
                (p, round_to_decimals(total))
            })
            .collect()
    };
    outputs
        .metadata_per_period
        .insert(TradeMetadataKey::HeatDump, sum_over_agents(&primal.heat_dump));
    outputs
        .metadata_per_period
        .insert(TradeMetadataKey::CoolDump, sum_over_agents(&primal.cool_dump));
    outputs
        .metadata_per_period
        .insert(TradeMetadataKey::CmCoolProd, per_period(&primal.c_cc));
    outputs
        .metadata_per_period
        .insert(TradeMetadataKey::CmHeatProd, per_period(&primal.h_cc));
    outputs
        .metadata_per_period
        .insert(TradeMetadataKey::CmElecCons, per_period(&primal.p_cc));
}

/// Extracts one agent's trades and metadata from its standalone model and
/// merges them into the shared outputs.
#[allow(clippy::too_many_arguments)]
pub fn extract_agent_outputs(
    primal: &AgentPrimal,
    inputs: &HorizonInputs,
    i: usize,
    elec_grid_guid: &str,
    heat_grid_guid: &str,
    elec_pricing: &mut ElectricityPrice,
    heat_pricing: &mut HeatingPrice,
    outputs: &mut OptimizerOutputs,
) {
    let periods = inputs.periods();
    let guid = inputs.agent_guids[i].clone();
    let params = TariffParams::from_inputs(inputs);
    let total_elec_bought: f64 = primal.p_buy_market.iter().sum();
    let total_heat_bought: f64 = primal.h_buy_market.iter().sum();
    let heat_retail =
        reconstruct_heat_retail(&params, primal.monthly_heat_peak_energy, total_heat_bought);

    for (t, &period) in periods.iter().enumerate() {
        let retail =
            reconstruct_elec_retail(&params, t, primal.avg_elec_peak_load, total_elec_bought);
        let wholesale = reconstruct_elec_wholesale(&params, t);

        // The agent's own electricity trade against the external market
        let net = primal.p_buy_market[t] - primal.p_sell_market[t];
        let action = if net > 0.0 { Action::Buy } else { Action::Sell };
        let price = if net > 0.0 { retail.price } else { wholesale };
        if let Some(trade) = Trade::from_net_quantity(
            period,
            &guid,
            action,
            Resource::Electricity,
            net,
            Some(price),
            false,
            Market::External,
            0.0,
        ) {
            if action == Action::Buy {
                elec_pricing
                    .observations
                    .add_price_estimate_for_agent(period, retail.price, &guid);
            }
            outputs.trades.push(trade);
        }

        // Counterpart row for the grid operator
        let external_net = primal.p_sell_market[t] - primal.p_buy_market[t];
        if external_net > VERY_SMALL_NUMBER {
            if let Some(trade) = Trade::from_net_quantity(
                period,
                elec_grid_guid,
                Action::Buy,
                Resource::Electricity,
                external_net,
                Some(wholesale),
                true,
                Market::External,
                0.0,
            ) {
                outputs.trades.push(trade);
            }
            elec_pricing.observations.add_external_sell_for_agent(period, 0.0, &guid);
        } else {
            let sold = (-external_net).max(0.0);
            if let Some(trade) = Trade::from_net_quantity(
                period,
                elec_grid_guid,
                Action::Sell,
                Resource::Electricity,
                sold,
                Some(retail.price),
                true,
                Market::External,
                0.0,
            ) {
                outputs.trades.push(trade.with_fees(retail.grid_fee, retail.tax));
            }
            elec_pricing.observations.add_external_sell_for_agent(
                period,
                if sold > VERY_SMALL_NUMBER { sold } else { 0.0 },
                &guid,
            );
        }

        // Heat: buys only. The agent's trade is measured at its wall, the
        // operator's at injection.
        let heat_bought = primal.h_buy_market[t];
        if let Some(trade) = Trade::from_net_quantity(
            period,
            &guid,
            Action::Buy,
            Resource::HighTempHeat,
            heat_bought * (1.0 - inputs.heat_trans_loss),
            Some(heat_retail),
            false,
            Market::External,
            inputs.heat_trans_loss,
        ) {
            heat_pricing
                .observations
                .add_price_estimate_for_agent(period, heat_retail, &guid);
            outputs.trades.push(trade);
        }
        if let Some(trade) = Trade::from_net_quantity(
            period,
            heat_grid_guid,
            Action::Sell,
            Resource::HighTempHeat,
            heat_bought,
            Some(heat_retail),
            true,
            Market::External,
            inputs.heat_trans_loss,
        ) {
            outputs.trades.push(trade);
        }
        heat_pricing.observations.add_external_sell_for_agent(
            period,
            if heat_bought > VERY_SMALL_NUMBER { heat_bought } else { 0.0 },
            &guid,
        );
    }

    // Level series for this agent
    let bites = BitesParameters::for_area(inputs.bites_area[i]);
    let mut insert = |key: TradeMetadataKey, values: &Vec<f64>, keep: bool, divide_by: f64| {
        if !keep {
            return;
        }
        let series: BTreeMap<DateTime<Utc>, f64> = periods
            .iter()
            .enumerate()
            .map(|(t, &p)| (p, round_to_decimals(values[t] / divide_by)))
            .collect();
        outputs
            .metadata_per_agent
            .entry(key)
            .or_default()
            .insert(guid.clone(), series);
    };
    insert(TradeMetadataKey::BatteryLevel, &primal.soc_bes, inputs.battery_capacity[i] > 0.0, 1.0);
    insert(TradeMetadataKey::AccTankLevel, &primal.soc_tes, inputs.acc_tank_kwh_per_deg[i] > 0.0, 1.0);
    let has_shallow = bites.shallow_capacity_kwh > 0.0;
    let has_deep = bites.deep_capacity_kwh > 0.0;
    insert(
        TradeMetadataKey::ShallowStorageRel,
        &primal.energy_shallow,
        has_shallow,
        bites.shallow_capacity_kwh.max(1.0),
    );
    insert(TradeMetadataKey::ShallowStorageAbs, &primal.energy_shallow, has_shallow, 1.0);
    insert(
        TradeMetadataKey::DeepStorageRel,
        &primal.energy_deep,
        has_deep,
        bites.deep_capacity_kwh.max(1.0),
    );
    insert(TradeMetadataKey::DeepStorageAbs, &primal.energy_deep, has_deep, 1.0);
    insert(TradeMetadataKey::ShallowLoss, &primal.loss_shallow, has_shallow, 1.0);
    insert(TradeMetadataKey::DeepLoss, &primal.loss_deep, has_deep, 1.0);
    insert(TradeMetadataKey::ShallowCharge, &primal.h_cha_shallow, has_shallow, 1.0);
    insert(TradeMetadataKey::FlowShallowToDeep, &primal.flow, has_deep, 1.0);
    insert(TradeMetadataKey::HpCoolProd, &primal.c_hp, inputs.heatpump_max_power[i] > 0.0, 1.0);
    if let Some(h_hp_b) = &primal.h_hp_b {
        insert(TradeMetadataKey::HpLowHeatProd, &primal.h_hp, inputs.heatpump_max_power[i] > 0.0, 1.0);
        insert(TradeMetadataKey::HpHighHeatProd, h_hp_b, inputs.booster_max_power[i] > 0.0, 1.0);
    } else {
        insert(TradeMetadataKey::HpHighHeatProd, &primal.h_hp, inputs.heatpump_max_power[i] > 0.0, 1.0);
    }
    insert(TradeMetadataKey::HeatDump, &primal.heat_dump, true, 1.0);
    insert(TradeMetadataKey::CoolDump, &primal.cool_dump, true, 1.0);

    outputs
        .shallow_storage_end
        .insert(guid.clone(), primal.energy_shallow[inputs.horizon - 1]);
    outputs.deep_storage_end.insert(guid, primal.energy_deep[inputs.horizon - 1]);
}

/// Merges the per-agent grid counterpart rows into one external trade per
/// (period, resource, action): quantities summed, the price averaged with
/// the weights the settlement uses, so the merged row carries the same
/// monetary value as the rows it replaces.
pub fn aggregate_external_trades(outputs: &mut OptimizerOutputs) {
    let mut merged: BTreeMap<(DateTime<Utc>, Resource, Action), Trade> = BTreeMap::new();
    let mut kept = Vec::with_capacity(outputs.trades.len());
    for trade in outputs.trades.drain(..) {
        if !trade.by_external {
            kept.push(trade);
            continue;
        }
        let key = (trade.period, trade.resource, trade.action);
        match merged.get_mut(&key) {
            None => {
                merged.insert(key, trade);
            }
            Some(existing) => {
                let (existing_weight, weight) = match trade.action {
                    // A SELL is paid for post-loss energy, a BUY for pre-loss
                    Action::Sell => (existing.quantity_post_loss, trade.quantity_post_loss),
                    Action::Buy => (existing.quantity_pre_loss, trade.quantity_pre_loss),
                };
                let total_weight = existing_weight + weight;
                let combine = |a: Option<f64>, b: Option<f64>| -> Option<f64> {
                    Some((a? * existing_weight + b? * weight) / total_weight)
                };
                existing.price = combine(existing.price, trade.price);
                existing.grid_fee_paid = (existing.grid_fee_paid * existing_weight
                    + trade.grid_fee_paid * weight)
                    / total_weight;
                existing.tax_paid =
                    (existing.tax_paid * existing_weight + trade.tax_paid * weight) / total_weight;
                existing.quantity_post_loss += trade.quantity_post_loss;
                existing.quantity_pre_loss += trade.quantity_pre_loss;
            }
        }
    }
    kept.extend(merged.into_values());
    outputs.trades = kept;
}

/// After all standalone agents are extracted, the per-agent dump series are
/// summed into the community-wide heat/cool dump series.
pub fn aggregate_agent_dumps(outputs: &mut OptimizerOutputs) {
    for key in [TradeMetadataKey::HeatDump, TradeMetadataKey::CoolDump] {
        let total = sum_for_all_agents(outputs.metadata_per_agent.get(&key));
        outputs.metadata_per_period.insert(key, total);
    }
}

fn sum_for_all_agents(
    per_agent: Option<&std::collections::HashMap<String, BTreeMap<DateTime<Utc>, f64>>>,
) -> BTreeMap<DateTime<Utc>, f64> {
    let mut totals = BTreeMap::new();
    if let Some(per_agent) = per_agent {
        for series in per_agent.values() {
            for (&period, &value) in series {
                *totals.entry(period).or_insert(0.0) += value;
            }
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaInfo;
    use crate::domain::hourly_range;
    use chrono::TimeZone;

    fn inputs_with_flat_spot(n: usize) -> HorizonInputs {
        let start = Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap();
        let area_info = AreaInfo::default();
        let h = 4;
        HorizonInputs {
            start,
            horizon: h,
            month: 2,
            summer_mode: false,
            agent_guids: (0..n).map(|i| format!("agent-{i}")).collect(),
            elec_demand: vec![vec![0.0; h]; n],
            elec_supply: vec![vec![0.0; h]; n],
            high_heat_demand: vec![vec![0.0; h]; n],
            high_heat_supply: vec![vec![0.0; h]; n],
            low_heat_demand: vec![vec![0.0; h]; n],
            low_heat_supply: vec![vec![0.0; h]; n],
            cooling_demand: vec![vec![0.0; h]; n],
            cooling_supply: vec![vec![0.0; h]; n],
            battery_capacity: vec![0.0; n],
            battery_max_charge: vec![0.0; n],
            battery_max_discharge: vec![0.0; n],
            heatpump_max_power: vec![0.0; n],
            heatpump_max_heat: vec![0.0; n],
            booster_max_power: vec![0.0; n],
            booster_max_heat: vec![0.0; n],
            acc_tank_kwh_per_deg: vec![0.0; n],
            bites_area: vec![0.0; n],
            hp_produce_cooling: vec![false; n],
            borehole: vec![false; n],
            shallow_storage_start: vec![0.0; n],
            deep_storage_start: vec![0.0; n],
            nordpool_price: vec![1.0; h],
            heat_retail_price: 0.5,
            elec_tax_fee: 0.392,
            elec_trans_fee: 0.148,
            elec_peak_load_fee: 1.25,
            heat_peak_load_fee: 2.4,
            incentive_fee: 0.05,
            hist_top_three_elec_peak_load: [0.0; 3],
            hist_monthly_heat_peak_energy: 0.0,
            heat_pump_cop: area_info.cop_heat_pumps_high_temp,
            booster_cop: area_info.cop_booster_pumps,
            battery_efficiency: area_info.battery_efficiency,
            acc_tank_efficiency: area_info.acc_tank_efficiency,
            acc_tank_max_temp: 65.0,
            max_elec_transfer_between_agents: 500.0,
            max_elec_transfer_to_external: 1000.0,
            max_heat_transfer_between_agents: 500.0,
            max_heat_transfer_to_external: 1000.0,
            chiller_cop: area_info.comp_chiller_cop,
            chiller_heat_recovery: area_info.comp_chiller_heat_recovery,
            chiller_max_input: area_info.comp_chiller_max_input,
            heat_trans_loss: 0.05,
            cold_trans_loss: 0.05,
            storage_end_charge_level: 0.5,
            penalty: 1000.0,
        }
    }

    #[test]
    fn test_elec_retail_reconstruction_inverts_objective() {
        let inputs = inputs_with_flat_spot(1);
        // Peak variable 40 kW, 100 kWh bought: the horizon's effect fee is
        // 1.25 * 40 = 50 SEK, i.e. 0.5 SEK/kWh on top
        let retail = reconstruct_elec_retail(&TariffParams::from_inputs(&inputs), 0, 40.0, 100.0);
        assert!((retail.price - (1.0 + 0.148 + 0.392 + 0.5)).abs() < 1e-9);
        assert!((retail.grid_fee - (0.5 + 0.148)).abs() < 1e-9);
        assert!((retail.tax - 0.392).abs() < 1e-9);
        // Grid-fee reconstruction closes: fee share times kWh equals the
        // objective's effect-fee term
        let recovered_total = (retail.grid_fee - inputs.elec_trans_fee) * 100.0;
        assert!((recovered_total - 1.25 * 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_heat_retail_reconstruction() {
        let inputs = inputs_with_flat_spot(1);
        // Peak-day energy 240 kWh, 120 kWh bought in horizon:
        // (2.4 / 24) * 240 / 120 = 0.2 SEK/kWh on top
        let retail = reconstruct_heat_retail(&TariffParams::from_inputs(&inputs), 240.0, 120.0);
        assert!((retail - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_no_purchases_means_no_effect_share() {
        let inputs = inputs_with_flat_spot(1);
        let retail = reconstruct_elec_retail(&TariffParams::from_inputs(&inputs), 0, 40.0, 0.0);
        assert!((retail.price - (1.0 + 0.148 + 0.392)).abs() < 1e-9);
    }

    #[test]
    fn test_cems_extraction_emits_balanced_trades() {
        let inputs = inputs_with_flat_spot(2);
        let h = inputs.horizon;
        let mut primal = CemsPrimal {
            p_buy_market: vec![10.0; h],
            p_sell_market: vec![0.0; h],
            h_buy_market: vec![20.0; h],
            p_cc: vec![0.0; h],
            h_cc: vec![0.0; h],
            c_cc: vec![0.0; h],
            avg_elec_peak_load: 10.0,
            monthly_heat_peak_energy: 20.0 * h as f64,
            p_buy_grid: vec![vec![10.0; h], vec![0.0; h]],
            p_sell_grid: vec![vec![0.0; h], vec![0.0; h]],
            h_buy_grid: vec![vec![19.0; h], vec![0.0; h]],
            h_sell_grid: vec![vec![0.0; h], vec![0.0; h]],
            c_buy_grid: vec![vec![0.0; h]; 2],
            c_sell_grid: vec![vec![0.0; h]; 2],
            soc_bes: vec![vec![0.5; h]; 2],
            soc_tes: vec![vec![0.5; h]; 2],
            h_hp: vec![vec![0.0; h]; 2],
            c_hp: vec![vec![0.0; h]; 2],
            energy_shallow: vec![vec![0.0; h]; 2],
            h_cha_shallow: vec![vec![0.0; h]; 2],
            flow: vec![vec![0.0; h]; 2],
            loss_shallow: vec![vec![0.0; h]; 2],
            energy_deep: vec![vec![0.0; h]; 2],
            loss_deep: vec![vec![0.0; h]; 2],
            heat_dump: vec![vec![0.0; h]; 2],
            cool_dump: vec![vec![0.0; h]; 2],
            h_hp_b: None,
        };
        // 5% heat loss: agents receive 19 of the 20 injected
        primal.h_buy_grid[0] = vec![19.0; h];
        let mut elec_pricing = crate::pricing::ElectricityPrice::new(
            hourly_range(inputs.start, h).into_iter().map(|p| (p, 1.0)).collect(),
            inputs.elec_tax_fee,
            inputs.elec_trans_fee,
            Default::default(),
            inputs.incentive_fee,
            35.0,
        );
        let mut heat_pricing = crate::pricing::HeatingPrice::new(0.5, 68.0);
        let outputs = extract_cems_outputs(
            &primal,
            &inputs,
            "ElecGrid",
            "HeatGrid",
            &mut elec_pricing,
            &mut heat_pricing,
        );

        // Per hour and resource, BUY pre-loss equals SELL post-loss
        for period in inputs.periods() {
            for resource in [Resource::Electricity, Resource::HighTempHeat] {
                let buys: f64 = outputs
                    .trades
                    .iter()
                    .filter(|t| {
                        t.period == period && t.resource == resource && t.action == Action::Buy
                    })
                    .map(|t| t.quantity_pre_loss)
                    .sum();
                let sells: f64 = outputs
                    .trades
                    .iter()
                    .filter(|t| {
                        t.period == period && t.resource == resource && t.action == Action::Sell
                    })
                    .map(|t| t.quantity_post_loss)
                    .sum();
                assert!(
                    (buys - sells).abs() < 1e-6,
                    "unbalanced {resource} at {period}: {buys} vs {sells}"
                );
            }
        }

        // Zero-sum settlement over all priced trades
        for period in inputs.periods() {
            let total: f64 = outputs
                .trades
                .iter()
                .filter(|t| t.period == period)
                .map(|t| t.cost())
                .sum();
            assert!(total.abs() < 1e-6, "non-zero settlement at {period}: {total}");
        }

        // The external sells were registered for the tariff computation
        let month = crate::domain::YearMonth::new(2019, 2);
        assert!(
            crate::pricing::consumption_for_month(heat_pricing.observations.sells(None), month)
                > 0.0
        );

        // Storage carry-over is present for both agents
        assert_eq!(outputs.shallow_storage_end.len(), 2);
    }
}
