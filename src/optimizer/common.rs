//! Device constraint families shared by the community model and the
//! single-agent model. Each builder covers one device for one agent across
//! the horizon; the callers instantiate them per agent.

use good_lp::{constraint, Constraint, Variable};

use crate::domain::BitesParameters;

/// Passive loss factors of the building-inertia layers, per hour.
pub const K_LOSS_SHALLOW: f64 = 0.9913;
pub const K_LOSS_DEEP: f64 = 0.9963;

/// Battery storage: rate limits, SOC dynamics with charge/discharge
/// efficiency, a relaxed exclusion between charging and discharging, and a
/// cyclic end condition so no horizon can borrow energy from the next one.
#[allow(clippy::too_many_arguments)]
pub fn battery_constraints(
    p_cha: &[Variable],
    p_dis: &[Variable],
    soc: &[Variable],
    capacity_kwh: f64,
    max_charge: f64,
    max_discharge: f64,
    efficiency: f64,
    soc_start: f64,
) -> Vec<Constraint> {
    let horizon = p_cha.len();
    let mut constraints = Vec::new();
    for t in 0..horizon {
        constraints.push(constraint!(p_cha[t] <= max_charge));
        constraints.push(constraint!(p_dis[t] <= max_discharge));
        if capacity_kwh == 0.0 {
            constraints.push(constraint!(p_cha[t] + p_dis[t] == 0.0));
            continue;
        }
        let charge = p_cha[t] * (efficiency / capacity_kwh);
        let discharge = p_dis[t] * (1.0 / (capacity_kwh * efficiency));
        if t == 0 {
            constraints.push(constraint!(soc[0] == charge - discharge + soc_start));
        } else {
            constraints.push(constraint!(soc[t] == soc[t - 1] + charge - discharge));
        }
        // LP relaxation of the charge-XOR-discharge exclusion
        if max_charge > 0.0 && max_discharge > 0.0 {
            constraints.push(constraint!(
                p_dis[t] * (1.0 / max_discharge) + p_cha[t] * (1.0 / max_charge) <= 1.0
            ));
        }
    }
    if capacity_kwh > 0.0 {
        constraints.push(constraint!(soc[horizon - 1] == soc_start));
    }
    constraints
}

/// Accumulator tank: like the battery but scaled by the tank's thermal
/// capacity `kwh_per_deg * max_temp`.
#[allow(clippy::too_many_arguments)]
pub fn acc_tank_constraints(
    htes_cha: &[Variable],
    htes_dis: &[Variable],
    soc: &[Variable],
    kwh_per_deg: f64,
    max_temp: f64,
    efficiency: f64,
    soc_start: f64,
) -> Vec<Constraint> {
    let horizon = htes_cha.len();
    let capacity = kwh_per_deg * max_temp;
    let mut constraints = Vec::new();
    for t in 0..horizon {
        constraints.push(constraint!(htes_dis[t] <= capacity));
        constraints.push(constraint!(htes_cha[t] <= capacity));
        if kwh_per_deg == 0.0 {
            constraints.push(constraint!(htes_dis[t] + htes_cha[t] == 0.0));
            continue;
        }
        let charge = htes_cha[t] * (efficiency / capacity);
        let discharge = htes_dis[t] * (1.0 / (capacity * efficiency));
        if t == 0 {
            constraints.push(constraint!(soc[0] == charge - discharge + soc_start));
        } else {
            constraints.push(constraint!(soc[t] == soc[t - 1] + charge - discharge));
        }
    }
    if kwh_per_deg > 0.0 {
        constraints.push(constraint!(soc[horizon - 1] == soc_start));
    }
    constraints
}

/// Two-layer building inertia storage: shallow layer charged from the heat
/// balance, deep layer fed by the inter-layer flow, both leaking a fixed
/// fraction of the previous hour's content.
#[allow(clippy::too_many_arguments)]
pub fn bites_constraints(
    energy_shallow: &[Variable],
    h_cha_shallow: &[Variable],
    flow: &[Variable],
    loss_shallow: &[Variable],
    energy_deep: &[Variable],
    loss_deep: &[Variable],
    bites: BitesParameters,
    shallow_start: f64,
    deep_start: f64,
    space_heat_demand: &[f64],
    charge_headroom: &[f64],
) -> Vec<Constraint> {
    let horizon = energy_shallow.len();
    let mut constraints = Vec::new();
    for t in 0..horizon {
        if t == 0 {
            constraints.push(constraint!(
                energy_shallow[0] == h_cha_shallow[0] - flow[0] - loss_shallow[0] + shallow_start
            ));
            constraints.push(constraint!(energy_deep[0] == flow[0] - loss_deep[0] + deep_start));
            constraints.push(constraint!(loss_shallow[0] == 0.0));
            constraints.push(constraint!(loss_deep[0] == 0.0));
        } else {
            constraints.push(constraint!(
                energy_shallow[t]
                    == energy_shallow[t - 1] + h_cha_shallow[t] - flow[t] - loss_shallow[t]
            ));
            constraints.push(constraint!(
                energy_deep[t] == energy_deep[t - 1] + flow[t] - loss_deep[t]
            ));
            constraints.push(constraint!(
                loss_shallow[t] == energy_shallow[t - 1] * (1.0 - K_LOSS_SHALLOW)
            ));
            constraints
                .push(constraint!(loss_deep[t] == energy_deep[t - 1] * (1.0 - K_LOSS_DEEP)));
        }
        if bites.shallow_capacity_kwh == 0.0 || bites.deep_capacity_kwh == 0.0 {
            constraints.push(constraint!(flow[t] == 0.0));
        } else {
            constraints.push(constraint!(
                flow[t]
                    == energy_shallow[t] * (bites.inter_layer_k / bites.shallow_capacity_kwh)
                        - energy_deep[t] * (bites.inter_layer_k / bites.deep_capacity_kwh)
            ));
        }
        constraints.push(constraint!(energy_shallow[t] <= bites.shallow_capacity_kwh));
        constraints.push(constraint!(energy_deep[t] <= bites.deep_capacity_kwh));
        // Negative charge means discharge; it can serve at most the hour's
        // space heating demand
        constraints.push(constraint!(h_cha_shallow[t] >= -bites.max_shallow_rate_kwh));
        constraints.push(constraint!(h_cha_shallow[t] <= bites.max_shallow_rate_kwh));
        constraints.push(constraint!(h_cha_shallow[t] >= -space_heat_demand[t]));
        constraints.push(constraint!(h_cha_shallow[t] <= charge_headroom[t]));
    }
    constraints
}

/// Heat pump coupling: heat output follows the COP, the cooling side only
/// exists for pumps that can run in reverse.
pub fn heat_pump_constraints(
    p_hp: &[Variable],
    h_hp: &[Variable],
    c_hp: &[Variable],
    cop: f64,
    max_power: f64,
    max_heat: f64,
    produces_cooling: bool,
) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    for t in 0..p_hp.len() {
        constraints.push(constraint!(h_hp[t] == p_hp[t] * cop));
        if produces_cooling {
            constraints.push(constraint!(c_hp[t] == p_hp[t] * (cop - 1.0)));
        } else {
            constraints.push(constraint!(c_hp[t] == 0.0));
        }
        constraints.push(constraint!(p_hp[t] <= max_power));
        constraints.push(constraint!(h_hp[t] <= max_heat));
    }
    constraints
}

/// Booster heat pump, summer only: covers the share of hot water the
/// low-temperature path cannot lift.
pub fn booster_constraints(
    p_hp_b: &[Variable],
    h_hp_b: &[Variable],
    cop: f64,
    max_heat: f64,
) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    for t in 0..p_hp_b.len() {
        constraints.push(constraint!(h_hp_b[t] == p_hp_b[t] * cop));
        constraints.push(constraint!(h_hp_b[t] <= max_heat));
    }
    constraints
}
