//! The community energy management MILP: one joint model scheduling every
//! agent's devices and the shared bus/chiller against the external markets.
//!
//! Summer and winter horizons instantiate distinct heat constraint families
//! from the shared device builders; the cooling balance switches on the
//! calendar month independently.

use good_lp::{constraint, variable, Constraint, Expression, ProblemVariables, Solution,
    SolverModel, Variable};

use super::common;
use super::infeasible;
use crate::domain::BitesParameters;
use crate::error::InfeasibilityError;
use crate::horizon::HorizonInputs;

/// Share of high-temperature (hot water) need coverable by the
/// low-temperature heat path in summer; the booster pump lifts the rest.
pub const PERC_OF_HT_COVERABLE_BY_LT: f64 = 0.6;

/// Decision variable handles for the community model, indexed `[agent][hour]`
/// or `[hour]` for community-wide quantities.
pub struct CemsVars {
    // Community-wide, per hour
    pub p_buy_market: Vec<Variable>,
    pub p_sell_market: Vec<Variable>,
    pub h_buy_market: Vec<Variable>,
    pub p_cc: Vec<Variable>,
    pub h_cc: Vec<Variable>,
    pub c_cc: Vec<Variable>,
    pub avg_elec_peak_load: Variable,
    pub monthly_heat_peak_energy: Variable,

    // Per agent, per hour
    pub p_buy_grid: Vec<Vec<Variable>>,
    pub p_sell_grid: Vec<Vec<Variable>>,
    pub u_power_buy_sell: Vec<Vec<Variable>>,
    pub h_buy_grid: Vec<Vec<Variable>>,
    pub h_sell_grid: Vec<Vec<Variable>>,
    pub c_buy_grid: Vec<Vec<Variable>>,
    pub c_sell_grid: Vec<Vec<Variable>>,
    pub p_cha: Vec<Vec<Variable>>,
    pub p_dis: Vec<Vec<Variable>>,
    pub soc_bes: Vec<Vec<Variable>>,
    pub p_hp: Vec<Vec<Variable>>,
    pub h_hp: Vec<Vec<Variable>>,
    pub c_hp: Vec<Vec<Variable>>,
    pub htes_cha: Vec<Vec<Variable>>,
    pub htes_dis: Vec<Vec<Variable>>,
    pub soc_tes: Vec<Vec<Variable>>,
    pub energy_shallow: Vec<Vec<Variable>>,
    pub h_cha_shallow: Vec<Vec<Variable>>,
    pub flow: Vec<Vec<Variable>>,
    pub loss_shallow: Vec<Vec<Variable>>,
    pub energy_deep: Vec<Vec<Variable>>,
    pub loss_deep: Vec<Vec<Variable>>,
    pub heat_dump: Vec<Vec<Variable>>,
    pub cool_dump: Vec<Vec<Variable>>,

    // Summer mode only
    pub p_hp_b: Option<Vec<Vec<Variable>>>,
    pub h_hp_b: Option<Vec<Vec<Variable>>>,
}

/// Primal values of a solved community model, same shapes as [`CemsVars`].
#[derive(Debug, Clone)]
pub struct CemsPrimal {
    pub p_buy_market: Vec<f64>,
    pub p_sell_market: Vec<f64>,
    pub h_buy_market: Vec<f64>,
    pub p_cc: Vec<f64>,
    pub h_cc: Vec<f64>,
    pub c_cc: Vec<f64>,
    pub avg_elec_peak_load: f64,
    pub monthly_heat_peak_energy: f64,

    pub p_buy_grid: Vec<Vec<f64>>,
    pub p_sell_grid: Vec<Vec<f64>>,
    pub h_buy_grid: Vec<Vec<f64>>,
    pub h_sell_grid: Vec<Vec<f64>>,
    pub c_buy_grid: Vec<Vec<f64>>,
    pub c_sell_grid: Vec<Vec<f64>>,
    pub soc_bes: Vec<Vec<f64>>,
    pub soc_tes: Vec<Vec<f64>>,
    pub h_hp: Vec<Vec<f64>>,
    pub c_hp: Vec<Vec<f64>>,
    pub energy_shallow: Vec<Vec<f64>>,
    pub h_cha_shallow: Vec<Vec<f64>>,
    pub flow: Vec<Vec<f64>>,
    pub loss_shallow: Vec<Vec<f64>>,
    pub energy_deep: Vec<Vec<f64>>,
    pub loss_deep: Vec<Vec<f64>>,
    pub heat_dump: Vec<Vec<f64>>,
    pub cool_dump: Vec<Vec<f64>>,
    pub h_hp_b: Option<Vec<Vec<f64>>>,
}

fn add_matrix(problem: &mut ProblemVariables, n: usize, h: usize) -> Vec<Vec<Variable>> {
    (0..n).map(|_| problem.add_vector(variable().min(0.0), h)).collect()
}

fn add_signed_matrix(problem: &mut ProblemVariables, n: usize, h: usize) -> Vec<Vec<Variable>> {
    (0..n).map(|_| problem.add_vector(variable(), h)).collect()
}

fn add_binary_matrix(problem: &mut ProblemVariables, n: usize, h: usize) -> Vec<Vec<Variable>> {
    (0..n).map(|_| problem.add_vector(variable().binary(), h)).collect()
}

fn build_vars(problem: &mut ProblemVariables, inputs: &HorizonInputs) -> CemsVars {
    let n = inputs.n_agents();
    let h = inputs.horizon;
    CemsVars {
        p_buy_market: problem.add_vector(variable().min(0.0), h),
        p_sell_market: problem.add_vector(variable().min(0.0), h),
        h_buy_market: problem.add_vector(variable().min(0.0), h),
        p_cc: problem.add_vector(variable().min(0.0), h),
        h_cc: problem.add_vector(variable().min(0.0), h),
        c_cc: problem.add_vector(variable().min(0.0), h),
        avg_elec_peak_load: problem.add(variable().min(0.0)),
        monthly_heat_peak_energy: problem.add(variable().min(0.0)),
        p_buy_grid: add_matrix(problem, n, h),
        p_sell_grid: add_matrix(problem, n, h),
        u_power_buy_sell: add_binary_matrix(problem, n, h),
        h_buy_grid: add_matrix(problem, n, h),
        h_sell_grid: add_matrix(problem, n, h),
        c_buy_grid: add_matrix(problem, n, h),
        c_sell_grid: add_matrix(problem, n, h),
        p_cha: add_matrix(problem, n, h),
        p_dis: add_matrix(problem, n, h),
        soc_bes: (0..n)
            .map(|_| problem.add_vector(variable().min(0.0).max(1.0), h))
            .collect(),
        p_hp: add_matrix(problem, n, h),
        h_hp: add_matrix(problem, n, h),
        c_hp: add_matrix(problem, n, h),
        htes_cha: add_matrix(problem, n, h),
        htes_dis: add_matrix(problem, n, h),
        soc_tes: (0..n)
            .map(|_| problem.add_vector(variable().min(0.0).max(1.0), h))
            .collect(),
        energy_shallow: add_matrix(problem, n, h),
        h_cha_shallow: add_signed_matrix(problem, n, h),
        flow: add_signed_matrix(problem, n, h),
        loss_shallow: add_matrix(problem, n, h),
        energy_deep: add_matrix(problem, n, h),
        loss_deep: add_matrix(problem, n, h),
        heat_dump: add_matrix(problem, n, h),
        cool_dump: add_matrix(problem, n, h),
        p_hp_b: if inputs.summer_mode { Some(add_matrix(problem, n, h)) } else { None },
        h_hp_b: if inputs.summer_mode { Some(add_matrix(problem, n, h)) } else { None },
    }
}

/// Minimise the community's energy bill: spot purchases net of spot sales,
/// district heating purchases, transmission fee and tax on imports, both
/// effect fees on their peak variables, and the big-M dump penalty.
fn build_objective(vars: &CemsVars, inputs: &HorizonInputs) -> Expression {
    let mut objective = Expression::from(0.0);
    for t in 0..inputs.horizon {
        objective += vars.p_buy_market[t] * inputs.nordpool_price[t];
        objective += vars.p_sell_market[t] * (-(inputs.nordpool_price[t] + inputs.incentive_fee));
        objective += vars.h_buy_market[t] * inputs.heat_retail_price;
        objective += vars.p_buy_market[t] * (inputs.elec_trans_fee + inputs.elec_tax_fee);
        for i in 0..inputs.n_agents() {
            objective += vars.heat_dump[i][t] * inputs.penalty;
            objective += vars.cool_dump[i][t] * inputs.penalty;
        }
    }
    objective += vars.avg_elec_peak_load * inputs.elec_peak_load_fee;
    objective += vars.monthly_heat_peak_energy * (inputs.heat_peak_load_fee / 24.0);
    objective
}

/// Bus balances, market caps, chiller coupling and the peak-tracking
/// variables the effect fees are charged on.
fn community_constraints(vars: &CemsVars, inputs: &HorizonInputs) -> Vec<Constraint> {
    let n = inputs.n_agents();
    let mut constraints = Vec::new();
    let [top1, top2, top3] = inputs.hist_top_three_elec_peak_load;
    constraints.push(constraint!(
        vars.avg_elec_peak_load >= (top1 + top2 + top3) / 3.0
    ));
    constraints.push(constraint!(
        vars.monthly_heat_peak_energy >= 24.0 * inputs.hist_monthly_heat_peak_energy
    ));
    let horizon_heat_import: Expression = vars.h_buy_market.iter().map(|&v| Expression::from(v)).sum();
    constraints.push(constraint!(vars.monthly_heat_peak_energy >= horizon_heat_import));

    for t in 0..inputs.horizon {
        // Replacing the smallest historical peak with this hour's import
        constraints.push(constraint!(
            vars.avg_elec_peak_load >= vars.p_buy_market[t] * (1.0 / 3.0) + (top1 + top2) / 3.0
        ));

        // Electricity bus: what agents and the chiller draw, plus exports,
        // equals what agents inject plus imports
        let agent_buys: Expression = (0..n).map(|i| Expression::from(vars.p_buy_grid[i][t])).sum();
        let agent_sells: Expression =
            (0..n).map(|i| Expression::from(vars.p_sell_grid[i][t])).sum();
        constraints.push(constraint!(
            agent_buys + vars.p_cc[t] + vars.p_sell_market[t]
                == agent_sells + vars.p_buy_market[t]
        ));

        // Heat bus with transfer loss on everything fed into it
        let heat_buys: Expression = (0..n).map(|i| Expression::from(vars.h_buy_grid[i][t])).sum();
        let heat_sells: Expression =
            (0..n).map(|i| Expression::from(vars.h_sell_grid[i][t])).sum();
        constraints.push(constraint!(
            heat_buys
                == (heat_sells + vars.h_buy_market[t] + vars.h_cc[t])
                    * (1.0 - inputs.heat_trans_loss)
        ));

        // Cooling bus; there is no external market for cooling
        let cool_buys: Expression = (0..n).map(|i| Expression::from(vars.c_buy_grid[i][t])).sum();
        let cool_sells: Expression =
            (0..n).map(|i| Expression::from(vars.c_sell_grid[i][t])).sum();
        constraints.push(constraint!(
            cool_buys == (cool_sells + vars.c_cc[t]) * (1.0 - inputs.cold_trans_loss)
        ));

        // External transfer caps
        constraints.push(constraint!(vars.p_buy_market[t] <= inputs.max_elec_transfer_to_external));
        constraints
            .push(constraint!(vars.p_sell_market[t] <= inputs.max_elec_transfer_to_external));
        constraints.push(constraint!(vars.h_buy_market[t] <= inputs.max_heat_transfer_to_external));

        // Compressor chiller: cooling follows the COP, the recovered heat is
        // a fraction of the absorbed energy
        constraints.push(constraint!(vars.c_cc[t] == vars.p_cc[t] * inputs.chiller_cop));
        constraints.push(constraint!(
            vars.h_cc[t]
                == (vars.p_cc[t] + vars.c_cc[t]) * inputs.chiller_heat_recovery
        ));
        constraints.push(constraint!(vars.p_cc[t] <= inputs.chiller_max_input));
    }
    constraints
}

/// Per-agent families independent of the season: electricity exclusion and
/// caps, battery, accumulator tank, BITES, heat pump, cooling balance.
fn agent_constraints(vars: &CemsVars, inputs: &HorizonInputs) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    let summer_cooling = crate::domain::is_summer_month(inputs.month);
    for i in 0..inputs.n_agents() {
        let bites = BitesParameters::for_area(inputs.bites_area[i]);
        let charge_headroom: Vec<f64> = (0..inputs.horizon)
            .map(|t| {
                inputs.heatpump_max_heat[i] + inputs.max_heat_transfer_between_agents
                    - inputs.low_heat_demand[i][t]
            })
            .collect();

        for t in 0..inputs.horizon {
            // Buying and selling electricity on the bus cannot happen in the
            // same hour
            constraints.push(constraint!(
                vars.p_buy_grid[i][t]
                    <= vars.u_power_buy_sell[i][t] * inputs.max_elec_transfer_between_agents
            ));
            constraints.push(constraint!(
                vars.p_sell_grid[i][t] + vars.u_power_buy_sell[i][t]
                    * inputs.max_elec_transfer_between_agents
                    <= inputs.max_elec_transfer_between_agents
            ));
            constraints.push(constraint!(
                vars.h_buy_grid[i][t] <= inputs.max_heat_transfer_between_agents
            ));

            // Electricity balance; the booster pump draw joins in summer
            let mut consumption = Expression::from(vars.p_hp[i][t]);
            consumption += vars.p_cha[i][t];
            consumption += vars.p_sell_grid[i][t];
            if let Some(p_hp_b) = &vars.p_hp_b {
                consumption += p_hp_b[i][t];
            }
            constraints.push(constraint!(
                vars.p_dis[i][t] + vars.p_buy_grid[i][t] + inputs.elec_supply[i][t]
                    == consumption + inputs.elec_demand[i][t]
            ));

            // Cooling balance: borehole free cooling wipes the demand
            // outside June-August
            let demand_factor = if !summer_cooling && inputs.borehole[i] { 0.0 } else { 1.0 };
            constraints.push(constraint!(
                vars.c_buy_grid[i][t] + vars.c_hp[i][t] + inputs.cooling_supply[i][t]
                    == vars.c_sell_grid[i][t]
                        + vars.cool_dump[i][t]
                        + inputs.cooling_demand[i][t] * demand_factor
            ));
        }

        constraints.extend(common::battery_constraints(
            &vars.p_cha[i],
            &vars.p_dis[i],
            &vars.soc_bes[i],
            inputs.battery_capacity[i],
            inputs.battery_max_charge[i],
            inputs.battery_max_discharge[i],
            inputs.battery_efficiency,
            inputs.storage_end_charge_level,
        ));
        constraints.extend(common::acc_tank_constraints(
            &vars.htes_cha[i],
            &vars.htes_dis[i],
            &vars.soc_tes[i],
            inputs.acc_tank_kwh_per_deg[i],
            inputs.acc_tank_max_temp,
            inputs.acc_tank_efficiency,
            inputs.storage_end_charge_level,
        ));
        constraints.extend(common::bites_constraints(
            &vars.energy_shallow[i],
            &vars.h_cha_shallow[i],
            &vars.flow[i],
            &vars.loss_shallow[i],
            &vars.energy_deep[i],
            &vars.loss_deep[i],
            bites,
            inputs.shallow_storage_start[i],
            inputs.deep_storage_start[i],
            &inputs.low_heat_demand[i],
            &charge_headroom,
        ));
        constraints.extend(common::heat_pump_constraints(
            &vars.p_hp[i],
            &vars.h_hp[i],
            &vars.c_hp[i],
            inputs.heat_pump_cop,
            inputs.heatpump_max_power[i],
            inputs.heatpump_max_heat[i],
            inputs.hp_produce_cooling[i],
        ));
    }
    constraints
}

/// Winter heat families: the district network is too hot to accept exports,
/// hot water comes straight out of the accumulator tank.
fn winter_heat_constraints(vars: &CemsVars, inputs: &HorizonInputs) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    for i in 0..inputs.n_agents() {
        let has_tank = inputs.acc_tank_kwh_per_deg[i] != 0.0;
        for t in 0..inputs.horizon {
            constraints.push(constraint!(vars.h_sell_grid[i][t] <= 0.0));

            let mut sinks = Expression::from(vars.h_sell_grid[i][t]);
            sinks += vars.h_cha_shallow[i][t];
            sinks += vars.heat_dump[i][t];
            if has_tank {
                sinks += vars.htes_cha[i][t];
            } else {
                sinks += inputs.high_heat_demand[i][t];
            }
            constraints.push(constraint!(
                vars.h_buy_grid[i][t] + vars.h_hp[i][t] + inputs.high_heat_supply[i][t]
                    == sinks + inputs.low_heat_demand[i][t]
            ));
            if has_tank {
                constraints
                    .push(constraint!(vars.htes_dis[i][t] == inputs.high_heat_demand[i][t]));
            }
        }
    }
    constraints
}

/// Summer heat families: exports allowed, the low-temperature path covers
/// most of the hot water and the booster pump lifts the rest.
fn summer_heat_constraints(vars: &CemsVars, inputs: &HorizonInputs) -> Vec<Constraint> {
    let p_hp_b = vars.p_hp_b.as_ref().expect("summer vars exist in summer mode");
    let h_hp_b = vars.h_hp_b.as_ref().expect("summer vars exist in summer mode");
    let mut constraints = Vec::new();
    for i in 0..inputs.n_agents() {
        let has_tank = inputs.acc_tank_kwh_per_deg[i] != 0.0;
        for t in 0..inputs.horizon {
            constraints.push(constraint!(
                vars.h_sell_grid[i][t] <= inputs.max_heat_transfer_between_agents
            ));

            let mut sinks = Expression::from(vars.h_sell_grid[i][t]);
            sinks += vars.h_cha_shallow[i][t];
            sinks += vars.heat_dump[i][t];
            if has_tank {
                sinks += vars.htes_cha[i][t] * PERC_OF_HT_COVERABLE_BY_LT;
            } else {
                sinks += inputs.high_heat_demand[i][t] * PERC_OF_HT_COVERABLE_BY_LT;
            }
            constraints.push(constraint!(
                vars.h_buy_grid[i][t]
                    + vars.h_hp[i][t]
                    + inputs.high_heat_supply[i][t]
                    + inputs.low_heat_supply[i][t]
                    == sinks + inputs.low_heat_demand[i][t]
            ));
            if has_tank {
                constraints
                    .push(constraint!(vars.htes_dis[i][t] == inputs.high_heat_demand[i][t]));
                constraints.push(constraint!(
                    h_hp_b[i][t] == vars.htes_cha[i][t] * (1.0 - PERC_OF_HT_COVERABLE_BY_LT)
                ));
            } else {
                constraints.push(constraint!(
                    h_hp_b[i][t]
                        == inputs.high_heat_demand[i][t] * (1.0 - PERC_OF_HT_COVERABLE_BY_LT)
                ));
            }
        }
        constraints.extend(common::booster_constraints(
            &p_hp_b[i],
            &h_hp_b[i],
            inputs.booster_cop,
            inputs.booster_max_heat[i],
        ));
    }
    constraints
}

/// Builds and solves the community model for one horizon.
pub fn solve_cems(inputs: &HorizonInputs) -> Result<CemsPrimal, InfeasibilityError> {
    let mut problem = ProblemVariables::new();
    let vars = build_vars(&mut problem, inputs);
    let objective = build_objective(&vars, inputs);

    let mut constraints = community_constraints(&vars, inputs);
    constraints.extend(agent_constraints(&vars, inputs));
    if inputs.summer_mode {
        constraints.extend(summer_heat_constraints(&vars, inputs));
    } else {
        constraints.extend(winter_heat_constraints(&vars, inputs));
    }

    let mut model = problem.minimise(objective).using(good_lp::default_solver);
    for c in constraints {
        model = model.with(c);
    }
    let solution = model
        .solve()
        .map_err(|e| infeasible(inputs.start, inputs.horizon, &inputs.agent_guids, e))?;

    let grab = |matrix: &Vec<Vec<Variable>>| -> Vec<Vec<f64>> {
        matrix
            .iter()
            .map(|row| row.iter().map(|&v| solution.value(v)).collect())
            .collect()
    };
    let grab1 = |row: &Vec<Variable>| -> Vec<f64> { row.iter().map(|&v| solution.value(v)).collect() };

    Ok(CemsPrimal {
        p_buy_market: grab1(&vars.p_buy_market),
        p_sell_market: grab1(&vars.p_sell_market),
        h_buy_market: grab1(&vars.h_buy_market),
        p_cc: grab1(&vars.p_cc),
        h_cc: grab1(&vars.h_cc),
        c_cc: grab1(&vars.c_cc),
        avg_elec_peak_load: solution.value(vars.avg_elec_peak_load),
        monthly_heat_peak_energy: solution.value(vars.monthly_heat_peak_energy),
        p_buy_grid: grab(&vars.p_buy_grid),
        p_sell_grid: grab(&vars.p_sell_grid),
        h_buy_grid: grab(&vars.h_buy_grid),
        h_sell_grid: grab(&vars.h_sell_grid),
        c_buy_grid: grab(&vars.c_buy_grid),
        c_sell_grid: grab(&vars.c_sell_grid),
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
        h_hp_b: vars.h_hp_b.as_ref().map(grab),
    })
}
