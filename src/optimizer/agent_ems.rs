//! Per-agent energy management model, used when the internal market is
//! disabled: each agent schedules its own devices directly against the
//! external tariffs, with no bus between neighbours and no shared chiller.

use good_lp::{constraint, variable, Constraint, Expression, ProblemVariables, Solution,
    SolverModel, Variable};

use super::cems::PERC_OF_HT_COVERABLE_BY_LT;
use super::common;
use super::infeasible;
use crate::domain::BitesParameters;
use crate::error::InfeasibilityError;
use crate::horizon::HorizonInputs;

struct AgentVars {
    p_buy_market: Vec<Variable>,
    p_sell_market: Vec<Variable>,
    u_power_buy_sell: Vec<Variable>,
    h_buy_market: Vec<Variable>,
    p_cha: Vec<Variable>,
    p_dis: Vec<Variable>,
    soc_bes: Vec<Variable>,
    p_hp: Vec<Variable>,
    h_hp: Vec<Variable>,
    c_hp: Vec<Variable>,
    htes_cha: Vec<Variable>,
    htes_dis: Vec<Variable>,
    soc_tes: Vec<Variable>,
    energy_shallow: Vec<Variable>,
    h_cha_shallow: Vec<Variable>,
    flow: Vec<Variable>,
    loss_shallow: Vec<Variable>,
    energy_deep: Vec<Variable>,
    loss_deep: Vec<Variable>,
    heat_dump: Vec<Variable>,
    cool_dump: Vec<Variable>,
    avg_elec_peak_load: Variable,
    monthly_heat_peak_energy: Variable,
    p_hp_b: Option<Vec<Variable>>,
    h_hp_b: Option<Vec<Variable>>,
}

/// Primal values of one agent's solved model, indexed by hour.
#[derive(Debug, Clone)]
pub struct AgentPrimal {
    pub p_buy_market: Vec<f64>,
    pub p_sell_market: Vec<f64>,
    pub h_buy_market: Vec<f64>,
    pub soc_bes: Vec<f64>,
    pub soc_tes: Vec<f64>,
    pub h_hp: Vec<f64>,
    pub c_hp: Vec<f64>,
    pub energy_shallow: Vec<f64>,
    pub h_cha_shallow: Vec<f64>,
    pub flow: Vec<f64>,
    pub loss_shallow: Vec<f64>,
    pub energy_deep: Vec<f64>,
    pub loss_deep: Vec<f64>,
    pub heat_dump: Vec<f64>,
    pub cool_dump: Vec<f64>,
    pub avg_elec_peak_load: f64,
    pub monthly_heat_peak_energy: f64,
    pub h_hp_b: Option<Vec<f64>>,
}

/// Builds and solves the standalone model for agent `i` of the horizon.
/// `hist_top_three` and `hist_heat_peak` are this agent's own tariff history.
pub fn solve_agent_ems(
    inputs: &HorizonInputs,
    i: usize,
    hist_top_three: [f64; 3],
    hist_heat_peak: f64,
) -> Result<AgentPrimal, InfeasibilityError> {
    let h = inputs.horizon;
    let mut problem = ProblemVariables::new();
    fn nonneg(problem: &mut ProblemVariables, h: usize) -> Vec<Variable> {
        problem.add_vector(variable().min(0.0), h)
    }
    fn signed(problem: &mut ProblemVariables, h: usize) -> Vec<Variable> {
        problem.add_vector(variable(), h)
    }
    let vars = AgentVars {
        p_buy_market: nonneg(&mut problem, h),
        p_sell_market: nonneg(&mut problem, h),
        h_buy_market: nonneg(&mut problem, h),
        p_cha: nonneg(&mut problem, h),
        p_dis: nonneg(&mut problem, h),
        p_hp: nonneg(&mut problem, h),
        h_hp: nonneg(&mut problem, h),
        c_hp: nonneg(&mut problem, h),
        htes_cha: nonneg(&mut problem, h),
        htes_dis: nonneg(&mut problem, h),
        energy_shallow: nonneg(&mut problem, h),
        h_cha_shallow: signed(&mut problem, h),
        flow: signed(&mut problem, h),
        loss_shallow: nonneg(&mut problem, h),
        energy_deep: nonneg(&mut problem, h),
        loss_deep: nonneg(&mut problem, h),
        heat_dump: nonneg(&mut problem, h),
        cool_dump: nonneg(&mut problem, h),
        p_hp_b: if inputs.summer_mode { Some(nonneg(&mut problem, h)) } else { None },
        h_hp_b: if inputs.summer_mode { Some(nonneg(&mut problem, h)) } else { None },
        u_power_buy_sell: problem.add_vector(variable().binary(), h),
        soc_bes: problem.add_vector(variable().min(0.0).max(1.0), h),
        soc_tes: problem.add_vector(variable().min(0.0).max(1.0), h),
        avg_elec_peak_load: problem.add(variable().min(0.0)),
        monthly_heat_peak_energy: problem.add(variable().min(0.0)),
    };

    let mut objective = Expression::from(0.0);
    for t in 0..h {
        objective += vars.p_buy_market[t] * inputs.nordpool_price[t];
        objective += vars.p_sell_market[t] * (-(inputs.nordpool_price[t] + inputs.incentive_fee));
        objective += vars.h_buy_market[t] * inputs.heat_retail_price;
        objective += vars.p_buy_market[t] * (inputs.elec_trans_fee + inputs.elec_tax_fee);
        objective += vars.heat_dump[t] * inputs.penalty;
        objective += vars.cool_dump[t] * inputs.penalty;
    }
    objective += vars.avg_elec_peak_load * inputs.elec_peak_load_fee;
    objective += vars.monthly_heat_peak_energy * (inputs.heat_peak_load_fee / 24.0);

    let mut constraints: Vec<Constraint> = Vec::new();
    let [top1, top2, top3] = hist_top_three;
    constraints.push(constraint!(vars.avg_elec_peak_load >= (top1 + top2 + top3) / 3.0));
    constraints.push(constraint!(vars.monthly_heat_peak_energy >= 24.0 * hist_heat_peak));
    let heat_import: Expression = vars.h_buy_market.iter().map(|&v| Expression::from(v)).sum();
    constraints.push(constraint!(vars.monthly_heat_peak_energy >= heat_import));

    let has_tank = inputs.acc_tank_kwh_per_deg[i] != 0.0;
    let summer_cooling = crate::domain::is_summer_month(inputs.month);
    for t in 0..h {
        constraints.push(constraint!(
            vars.avg_elec_peak_load >= vars.p_buy_market[t] * (1.0 / 3.0) + (top1 + top2) / 3.0
        ));

        constraints.push(constraint!(
            vars.p_buy_market[t]
                <= vars.u_power_buy_sell[t] * inputs.max_elec_transfer_to_external
        ));
        constraints.push(constraint!(
            vars.p_sell_market[t]
                + vars.u_power_buy_sell[t] * inputs.max_elec_transfer_to_external
                <= inputs.max_elec_transfer_to_external
        ));
        constraints.push(constraint!(vars.h_buy_market[t] <= inputs.max_heat_transfer_to_external));

        // Electricity balance
        let mut consumption = Expression::from(vars.p_hp[t]);
        consumption += vars.p_cha[t];
        consumption += vars.p_sell_market[t];
        if let Some(p_hp_b) = &vars.p_hp_b {
            consumption += p_hp_b[t];
        }
        constraints.push(constraint!(
            vars.p_dis[t] + vars.p_buy_market[t] + inputs.elec_supply[i][t]
                == consumption + inputs.elec_demand[i][t]
        ));

        // Heat balance; without the internal bus there is nowhere to sell
        let mut sinks = Expression::from(vars.h_cha_shallow[t]);
        sinks += vars.heat_dump[t];
        let hot_water_factor = if inputs.summer_mode { PERC_OF_HT_COVERABLE_BY_LT } else { 1.0 };
        if has_tank {
            sinks += vars.htes_cha[t] * hot_water_factor;
        } else {
            sinks += inputs.high_heat_demand[i][t] * hot_water_factor;
        }
        // The market import is metered at injection; the transfer loss eats
        // its share before the heat reaches the building
        let mut sources = vars.h_buy_market[t] * (1.0 - inputs.heat_trans_loss);
        sources += vars.h_hp[t];
        sources += inputs.high_heat_supply[i][t];
        if inputs.summer_mode {
            sources += inputs.low_heat_supply[i][t];
        }
        constraints.push(constraint!(sources == sinks + inputs.low_heat_demand[i][t]));

        if has_tank {
            constraints.push(constraint!(vars.htes_dis[t] == inputs.high_heat_demand[i][t]));
        }
        if let Some(h_hp_b) = &vars.h_hp_b {
            if has_tank {
                constraints.push(constraint!(
                    h_hp_b[t] == vars.htes_cha[t] * (1.0 - PERC_OF_HT_COVERABLE_BY_LT)
                ));
            } else {
                constraints.push(constraint!(
                    h_hp_b[t]
                        == inputs.high_heat_demand[i][t] * (1.0 - PERC_OF_HT_COVERABLE_BY_LT)
                ));
            }
        }

        // Cooling: the agent's own pump (and borehole) is all there is
        let demand_factor = if !summer_cooling && inputs.borehole[i] { 0.0 } else { 1.0 };
        constraints.push(constraint!(
            vars.c_hp[t] + inputs.cooling_supply[i][t]
                == vars.cool_dump[t] + inputs.cooling_demand[i][t] * demand_factor
        ));
    }

    let bites = BitesParameters::for_area(inputs.bites_area[i]);
    let charge_headroom: Vec<f64> = (0..h)
        .map(|t| {
            inputs.heatpump_max_heat[i] + inputs.max_heat_transfer_to_external
                - inputs.low_heat_demand[i][t]
        })
        .collect();
    constraints.extend(common::battery_constraints(
        &vars.p_cha,
        &vars.p_dis,
        &vars.soc_bes,
        inputs.battery_capacity[i],
        inputs.battery_max_charge[i],
        inputs.battery_max_discharge[i],
        inputs.battery_efficiency,
        inputs.storage_end_charge_level,
    ));
    constraints.extend(common::acc_tank_constraints(
        &vars.htes_cha,
        &vars.htes_dis,
        &vars.soc_tes,
        inputs.acc_tank_kwh_per_deg[i],
        inputs.acc_tank_max_temp,
        inputs.acc_tank_efficiency,
        inputs.storage_end_charge_level,
    ));
    constraints.extend(common::bites_constraints(
        &vars.energy_shallow,
        &vars.h_cha_shallow,
        &vars.flow,
        &vars.loss_shallow,
        &vars.energy_deep,
        &vars.loss_deep,
        bites,
        inputs.shallow_storage_start[i],
        inputs.deep_storage_start[i],
        &inputs.low_heat_demand[i],
        &charge_headroom,
    ));
    constraints.extend(common::heat_pump_constraints(
        &vars.p_hp,
        &vars.h_hp,
        &vars.c_hp,
        inputs.heat_pump_cop,
        inputs.heatpump_max_power[i],
        inputs.heatpump_max_heat[i],
        inputs.hp_produce_cooling[i],
    ));
    if let (Some(p_hp_b), Some(h_hp_b)) = (&vars.p_hp_b, &vars.h_hp_b) {
        constraints.extend(common::booster_constraints(
            p_hp_b,
            h_hp_b,
            inputs.booster_cop,
            inputs.booster_max_heat[i],
        ));
    }

    let mut model = problem.minimise(objective).using(good_lp::default_solver);
    for c in constraints {
        model = model.with(c);
    }
    let solution = model.solve().map_err(|e| {
        infeasible(inputs.start, inputs.horizon, &inputs.agent_guids[i..=i], e)
    })?;

    let grab = |row: &Vec<Variable>| -> Vec<f64> { row.iter().map(|&v| solution.value(v)).collect() };
    Ok(AgentPrimal {
        p_buy_market: grab(&vars.p_buy_market),
        p_sell_market: grab(&vars.p_sell_market),
        h_buy_market: grab(&vars.h_buy_market),
        soc_bes: grab(&vars.soc_bes),
        soc_tes: grab(&vars.soc_tes),
        h_hp: grab(&vars.h_hp),
        c_hp: grab(&vars.c_hp),
        energy_shallow: grab(&vars.energy_shallow),
        h_cha_shallow: grab(&vars.h_cha_shallow),
        flow: grab(&vars.flow),
        loss_shallow: grab(&vars.loss_shallow),
        energy_deep: grab(&vars.energy_deep),
        loss_deep: grab(&vars.loss_deep),
        heat_dump: grab(&vars.heat_dump),
        cool_dump: grab(&vars.cool_dump),
        avg_elec_peak_load: solution.value(vars.avg_elec_peak_load),
        monthly_heat_peak_energy: solution.value(vars.monthly_heat_peak_energy),
        h_hp_b: vars.h_hp_b.as_ref().map(grab),
    })
}
