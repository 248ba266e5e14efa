//! Post-hoc settlement: reconciling the per-horizon estimated prices against
//! the utility's exact monthly tariffs, and attributing the difference to
//! agents as extra costs.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::info;

use crate::domain::{Action, ExtraCost, ExtraCostType, Resource, Trade, YearMonth};

/// Per-month heating correction: the difference between what external buys
/// actually cost under the exact tariff and what they were settled at, owed
/// by the buyers in proportion to their consumption; symmetrically for
/// external sells and producers. The external operator receives the
/// balancing entry so the community's books stay closed.
///
/// `exact_retail` / `exact_wholesale` hold the finished months' per-kWh
/// prices, `None` where the month had no consumption. The estimated price of
/// each trade row is the price it was settled at.
pub fn heating_cost_corrections(
    trades: &[Trade],
    exact_retail: &HashMap<YearMonth, Option<f64>>,
    exact_wholesale: &HashMap<YearMonth, Option<f64>>,
    heat_grid_guid: &str,
) -> Vec<ExtraCost> {
    let mut corrections = Vec::new();
    for month in months_of(trades) {
        let exact_retail = exact_retail.get(&month).copied().flatten();
        let exact_wholesale = exact_wholesale.get(&month).copied().flatten();

        // Retail side: the operator sold to the community
        let retail_discrepancy: f64 = trades
            .iter()
            .filter(|t| {
                t.by_external
                    && t.resource == Resource::HighTempHeat
                    && t.action == Action::Sell
                    && YearMonth::of(t.period) == month
            })
            .filter_map(|t| Some(t.quantity_post_loss * (exact_retail? - t.price?)))
            .sum();
        let buyer_weights = flow_weights(trades, month, Action::Buy, heat_resources());
        distribute(
            &mut corrections,
            month,
            ExtraCostType::HeatExtCostCorr,
            heat_grid_guid,
            retail_discrepancy,
            &buyer_weights,
        );

        // Wholesale side: the operator bought from the community; sellers
        // owe back what they were overpaid
        let wholesale_discrepancy: f64 = trades
            .iter()
            .filter(|t| {
                t.by_external
                    && t.resource == Resource::HighTempHeat
                    && t.action == Action::Buy
                    && YearMonth::of(t.period) == month
            })
            .filter_map(|t| Some(t.quantity_pre_loss * (t.price? - exact_wholesale?)))
            .sum();
        let seller_weights = flow_weights(trades, month, Action::Sell, heat_resources());
        distribute(
            &mut corrections,
            month,
            ExtraCostType::HeatExtCostCorr,
            heat_grid_guid,
            wholesale_discrepancy,
            &seller_weights,
        );
    }
    corrections
}

/// Per-month electricity correction. The estimated retail carried an
/// in-progress view of the month's top-3 peaks; the exact tariff uses the
/// realised ones. Wholesale has no peak component, so only the retail side
/// can diverge. `exact_retail` holds the realised per-period prices.
pub fn electricity_cost_corrections(
    trades: &[Trade],
    exact_retail: &BTreeMap<DateTime<Utc>, Option<f64>>,
    elec_grid_guid: &str,
) -> Vec<ExtraCost> {
    let mut corrections = Vec::new();
    for month in months_of(trades) {
        let discrepancy: f64 = trades
            .iter()
            .filter(|t| {
                t.by_external
                    && t.resource == Resource::Electricity
                    && t.action == Action::Sell
                    && YearMonth::of(t.period) == month
            })
            .filter_map(|t| {
                let exact = exact_retail.get(&t.period).copied().flatten()?;
                Some(t.quantity_post_loss * (exact - t.price?))
            })
            .sum();
        let buyer_weights = flow_weights(trades, month, Action::Buy, &[Resource::Electricity]);
        distribute(
            &mut corrections,
            month,
            ExtraCostType::ElecExtCostCorr,
            elec_grid_guid,
            discrepancy,
            &buyer_weights,
        );
    }
    corrections
}

fn heat_resources() -> &'static [Resource] {
    // In summer the internal bus trades low-temperature heat while the
    // import stays high-temperature; both flows share the correction
    &[Resource::HighTempHeat, Resource::LowTempHeat]
}

fn months_of(trades: &[Trade]) -> BTreeSet<YearMonth> {
    trades.iter().map(|t| YearMonth::of(t.period)).collect()
}

/// kWh per internal agent on one side of the flow, for one month.
fn flow_weights(
    trades: &[Trade],
    month: YearMonth,
    action: Action,
    resources: &[Resource],
) -> BTreeMap<String, f64> {
    let mut weights: BTreeMap<String, f64> = BTreeMap::new();
    for trade in trades {
        if trade.by_external
            || trade.action != action
            || !resources.contains(&trade.resource)
            || YearMonth::of(trade.period) != month
        {
            continue;
        }
        let quantity = match action {
            Action::Buy => trade.quantity_pre_loss,
            Action::Sell => trade.quantity_post_loss,
        };
        *weights.entry(trade.agent_guid.clone()).or_insert(0.0) += quantity;
    }
    weights
}

/// Splits `discrepancy` across agents proportionally to their weights and
/// gives the external operator the balancing entry.
fn distribute(
    corrections: &mut Vec<ExtraCost>,
    month: YearMonth,
    cost_type: ExtraCostType,
    grid_guid: &str,
    discrepancy: f64,
    weights: &BTreeMap<String, f64>,
) {
    let total: f64 = weights.values().sum();
    if discrepancy.abs() < 1e-12 || total <= 0.0 {
        return;
    }
    info!(%month, ?cost_type, discrepancy, "distributing tariff correction");
    for (agent, weight) in weights {
        corrections.push(ExtraCost {
            month,
            agent_guid: agent.clone(),
            cost_type,
            amount: discrepancy * weight / total,
        });
    }
    corrections.push(ExtraCost {
        month,
        agent_guid: grid_guid.to_string(),
        cost_type,
        amount: -discrepancy,
    });
}

/// A volume an agent declared ahead of delivery: what it planned to buy or
/// sell at which price. Used to attribute a period's external over-cost to
/// the agents whose realised flows deviated from their declarations.
#[derive(Debug, Clone)]
pub struct PlannedVolume {
    pub agent_guid: String,
    pub action: Action,
    pub resource: Resource,
    pub quantity: f64,
    pub price: f64,
    pub by_external: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("trades from more than one trading period")]
    MultiplePeriods,

    #[error("more than one external plan for the resource")]
    MultipleExternalPlans,

    #[error("no external plan for the resource")]
    NoExternalPlan,

    #[error("more than one external trade for the resource")]
    MultipleExternalTrades,

    #[error("agent '{0}' has more than one plan for the period")]
    MultiplePlansForAgent(String),

    #[error("agent '{0}' has more than one trade for the period")]
    MultipleTradesForAgent(String),

    #[error("external retail price below the local price estimate")]
    RetailBelowLocalPrice,
}

/// Distributes one period's electricity over-cost across agents in
/// proportion to how far their realised net volumes deviated from their
/// declared ones.
///
/// When the community imported at a retail price above the local estimate,
/// the over-cost is `(retail - local) * imported`; when it exported at a
/// wholesale price below the local estimate, the lost revenue is
/// `(local - wholesale) * exported`. Either way, every deviating agent
/// carries a share proportional to its absolute deviation.
pub fn distribute_external_overcost(
    planned: &[PlannedVolume],
    trades: &[Trade],
    local_price: f64,
    external_wholesale_price: f64,
) -> Result<HashMap<String, f64>, BalanceError> {
    let elec_trades: Vec<&Trade> =
        trades.iter().filter(|t| t.resource == Resource::Electricity).collect();
    let periods: BTreeSet<_> = elec_trades.iter().map(|t| t.period).collect();
    if periods.len() > 1 {
        return Err(BalanceError::MultiplePeriods);
    }

    let external_plans: Vec<&PlannedVolume> = planned
        .iter()
        .filter(|p| p.by_external && p.resource == Resource::Electricity)
        .collect();
    if external_plans.len() > 1 {
        return Err(BalanceError::MultipleExternalPlans);
    }
    let external_plan = external_plans.first().ok_or(BalanceError::NoExternalPlan)?;
    if external_plan.action == Action::Sell && external_plan.price < local_price {
        return Err(BalanceError::RetailBelowLocalPrice);
    }

    let external_trades: Vec<&&Trade> = elec_trades.iter().filter(|t| t.by_external).collect();
    if external_trades.len() > 1 {
        return Err(BalanceError::MultipleExternalTrades);
    }

    let over_cost = match external_trades.first() {
        Some(external) => match external.action {
            Action::Sell => {
                let retail = external.price.unwrap_or(local_price);
                (retail - local_price) * external.quantity_post_loss
            }
            Action::Buy => (local_price - external_wholesale_price) * external.quantity_pre_loss,
        },
        None => 0.0,
    };

    // Net declared and realised volume per internal agent, buys positive
    let mut expected: HashMap<String, f64> = HashMap::new();
    let mut seen_plans: BTreeSet<&str> = BTreeSet::new();
    for plan in planned.iter().filter(|p| !p.by_external && p.resource == Resource::Electricity) {
        if !seen_plans.insert(&plan.agent_guid) {
            return Err(BalanceError::MultiplePlansForAgent(plan.agent_guid.clone()));
        }
        let signed = match plan.action {
            Action::Buy => plan.quantity,
            Action::Sell => -plan.quantity,
        };
        *expected.entry(plan.agent_guid.clone()).or_insert(0.0) += signed;
    }
    let mut realised: HashMap<String, f64> = HashMap::new();
    let mut seen_trades: BTreeSet<&str> = BTreeSet::new();
    for trade in elec_trades.iter().filter(|t| !t.by_external) {
        if !seen_trades.insert(&trade.agent_guid) {
            return Err(BalanceError::MultipleTradesForAgent(trade.agent_guid.clone()));
        }
        let signed = match trade.action {
            Action::Buy => trade.quantity_pre_loss,
            Action::Sell => -trade.quantity_post_loss,
        };
        *realised.entry(trade.agent_guid.clone()).or_insert(0.0) += signed;
    }

    let agents: BTreeSet<String> = expected.keys().chain(realised.keys()).cloned().collect();
    let deviations: BTreeMap<String, f64> = agents
        .into_iter()
        .map(|agent| {
            let deviation = realised.get(&agent).copied().unwrap_or(0.0)
                - expected.get(&agent).copied().unwrap_or(0.0);
            (agent, deviation.abs())
        })
        .collect();
    let total_deviation: f64 = deviations.values().sum();

    let mut costs = HashMap::new();
    for (agent, deviation) in deviations {
        let share =
            if total_deviation > 0.0 { over_cost * deviation / total_deviation } else { 0.0 };
        costs.insert(agent, share);
    }
    Ok(costs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Market;
    use chrono::TimeZone;

    fn some_period() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 2, 0, 0, 0).unwrap()
    }

    fn trade(agent: &str, action: Action, quantity: f64, price: f64, external: bool) -> Trade {
        Trade {
            period: some_period(),
            agent_guid: agent.into(),
            action,
            resource: Resource::Electricity,
            quantity_post_loss: quantity,
            quantity_pre_loss: quantity,
            price: Some(price),
            by_external: external,
            market: Market::Local,
            loss: 0.0,
            grid_fee_paid: 0.0,
            tax_paid: 0.0,
        }
    }

    fn heat_trade(agent: &str, action: Action, quantity: f64, price: f64, external: bool) -> Trade {
        Trade { resource: Resource::HighTempHeat, ..trade(agent, action, quantity, price, external) }
    }

    fn plan(agent: &str, action: Action, quantity: f64, price: f64, external: bool) -> PlannedVolume {
        PlannedVolume {
            agent_guid: agent.into(),
            action,
            resource: Resource::Electricity,
            quantity,
            price,
            by_external: external,
        }
    }

    fn exact_prices(month: YearMonth, price: Option<f64>) -> HashMap<YearMonth, Option<f64>> {
        HashMap::from([(month, price)])
    }

    fn find(corrections: &[ExtraCost], agent: &str) -> f64 {
        corrections.iter().filter(|c| c.agent_guid == agent).map(|c| c.amount).sum()
    }

    #[test]
    fn test_local_surplus_becomes_deficit() {
        // Local production was expected to cover demand at 0.5; instead 200
        // kWh had to be imported at 1.0. The 100 SEK over-cost falls on the
        // deviators in proportion to how far off they were.
        let planned = vec![
            plan("Seller1", Action::Sell, 2000.0, 0.5, false),
            plan("Buyer1", Action::Buy, 1900.0, f64::INFINITY, false),
            plan("Buyer2", Action::Buy, 100.0, f64::INFINITY, false),
            plan("Grid", Action::Sell, 10000.0, 1.0, true),
        ];
        let trades = vec![
            trade("Seller1", Action::Sell, 1990.0, 0.5, false),
            trade("Buyer1", Action::Buy, 2100.0, 0.5, false),
            trade("Buyer2", Action::Buy, 90.0, 0.5, false),
            trade("Grid", Action::Sell, 200.0, 1.0, true),
        ];
        let costs = distribute_external_overcost(&planned, &trades, 0.5, 0.5).unwrap();
        assert!((costs["Seller1"] - 4.545).abs() < 1e-3);
        assert!((costs["Buyer1"] - 90.909).abs() < 1e-3);
        assert!((costs["Buyer2"] - 4.545).abs() < 1e-3);
        let total: f64 = costs.values().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_local_deficit_becomes_surplus() {
        // Expected deficit priced locally at 1.0; the surplus of 100 kWh was
        // exported at wholesale 0.5, and only Buyer1 deviated.
        let planned = vec![
            plan("Seller1", Action::Sell, 2000.0, 0.5, false),
            plan("Buyer1", Action::Buy, 2000.0, f64::INFINITY, false),
            plan("Buyer2", Action::Buy, 100.0, f64::INFINITY, false),
            plan("Grid", Action::Sell, 10000.0, 1.0, true),
        ];
        let trades = vec![
            trade("Seller1", Action::Sell, 2000.0, 1.0, false),
            trade("Buyer1", Action::Buy, 1800.0, 1.0, false),
            trade("Buyer2", Action::Buy, 100.0, 1.0, false),
            trade("Grid", Action::Buy, 100.0, 1.0, true),
        ];
        let costs = distribute_external_overcost(&planned, &trades, 1.0, 0.5).unwrap();
        assert!((costs["Seller1"]).abs() < 1e-9);
        assert!((costs["Buyer1"] - 50.0).abs() < 1e-9);
        assert!((costs["Buyer2"]).abs() < 1e-9);
    }

    #[test]
    fn test_import_at_local_price_costs_nothing() {
        let planned = vec![
            plan("Seller1", Action::Sell, 100.0, 0.5, false),
            plan("Buyer1", Action::Buy, 200.0, f64::INFINITY, false),
            plan("Grid", Action::Sell, 10000.0, 1.0, true),
        ];
        let trades = vec![
            trade("Seller1", Action::Sell, 80.0, 1.0, false),
            trade("Buyer1", Action::Buy, 200.0, 1.0, false),
            trade("Grid", Action::Sell, 120.0, 1.0, true),
        ];
        let costs = distribute_external_overcost(&planned, &trades, 1.0, 0.5).unwrap();
        assert!(costs["Seller1"].abs() < 1e-9);
        assert!(costs["Buyer1"].abs() < 1e-9);
    }

    #[test]
    fn test_two_external_trades_is_an_error() {
        let planned = vec![plan("Grid", Action::Sell, 10000.0, 1.0, true)];
        let trades = vec![
            trade("Grid", Action::Sell, 100.0, 1.0, true),
            trade("Grid", Action::Buy, 100.0, 1.0, true),
        ];
        assert_eq!(
            distribute_external_overcost(&planned, &trades, 1.0, 0.5),
            Err(BalanceError::MultipleExternalTrades)
        );
    }

    #[test]
    fn test_mixed_periods_is_an_error() {
        let planned = vec![plan("Grid", Action::Sell, 10000.0, 1.0, true)];
        let mut late = trade("Buyer1", Action::Buy, 90.0, 0.5, false);
        late.period = some_period() + chrono::Duration::hours(1);
        let trades = vec![trade("Buyer1", Action::Buy, 100.0, 0.5, false), late];
        assert_eq!(
            distribute_external_overcost(&planned, &trades, 0.5, 0.5),
            Err(BalanceError::MultiplePeriods)
        );
    }

    #[test]
    fn test_no_external_plan_is_an_error() {
        let planned = vec![plan("Buyer1", Action::Buy, 100.0, f64::INFINITY, false)];
        let trades = vec![trade("Buyer1", Action::Buy, 100.0, 1.0, false)];
        assert_eq!(
            distribute_external_overcost(&planned, &trades, 1.0, 0.5),
            Err(BalanceError::NoExternalPlan)
        );
    }

    #[test]
    fn test_retail_below_local_price_is_an_error() {
        let planned = vec![plan("Grid", Action::Sell, 10000.0, 0.9, true)];
        let trades = vec![trade("Buyer1", Action::Buy, 100.0, 1.0, false)];
        assert_eq!(
            distribute_external_overcost(&planned, &trades, 1.0, 0.5),
            Err(BalanceError::RetailBelowLocalPrice)
        );
    }

    #[test]
    fn test_two_trades_for_agent_is_an_error() {
        let planned = vec![plan("Grid", Action::Sell, 10000.0, 1.0, true)];
        let trades = vec![
            trade("Buyer1", Action::Buy, 100.0, 0.5, false),
            trade("Buyer1", Action::Sell, 10.0, 0.5, false),
        ];
        assert!(matches!(
            distribute_external_overcost(&planned, &trades, 0.5, 0.5),
            Err(BalanceError::MultipleTradesForAgent(_))
        ));
    }

    #[test]
    fn test_heating_correction_external_sell() {
        // The operator sold 10 kWh at an estimated 0.5; the exact price came
        // out at 0.75. Buyers owe 2.5 split 60/40, the operator is owed the
        // balancing 2.5.
        let month = YearMonth::of(some_period());
        let trades = vec![
            heat_trade("Grid", Action::Sell, 10.0, 0.5, true),
            heat_trade("Buyer1", Action::Buy, 6.0, 0.5, false),
            heat_trade("Buyer2", Action::Buy, 4.0, 0.5, false),
        ];
        let corrections = heating_cost_corrections(
            &trades,
            &exact_prices(month, Some(0.75)),
            &exact_prices(month, None),
            "Grid",
        );
        assert!((find(&corrections, "Buyer1") - 1.5).abs() < 1e-9);
        assert!((find(&corrections, "Buyer2") - 1.0).abs() < 1e-9);
        assert!((find(&corrections, "Grid") + 2.5).abs() < 1e-9);
        // Consumer-side sum equals the month's discrepancy
        let consumer_total: f64 =
            find(&corrections, "Buyer1") + find(&corrections, "Buyer2");
        assert!((consumer_total - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_heating_correction_external_buy() {
        // The operator bought 10 kWh at an estimated wholesale of 0.5; the
        // exact price came out at 0.25. Sellers were overpaid 2.5, split
        // 60/40.
        let month = YearMonth::of(some_period());
        let trades = vec![
            heat_trade("Grid", Action::Buy, 10.0, 0.5, true),
            heat_trade("Seller1", Action::Sell, 6.0, 0.5, false),
            heat_trade("Seller2", Action::Sell, 4.0, 0.5, false),
        ];
        let corrections = heating_cost_corrections(
            &trades,
            &exact_prices(month, None),
            &exact_prices(month, Some(0.25)),
            "Grid",
        );
        assert!((find(&corrections, "Seller1") - 1.5).abs() < 1e-9);
        assert!((find(&corrections, "Seller2") - 1.0).abs() < 1e-9);
        assert!((find(&corrections, "Grid") + 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_heating_correction_refund_when_exact_lower() {
        let month = YearMonth::of(some_period());
        let trades = vec![
            heat_trade("Grid", Action::Sell, 10.0, 0.5, true),
            heat_trade("Buyer1", Action::Buy, 6.0, 0.5, false),
            heat_trade("Buyer2", Action::Buy, 4.0, 0.5, false),
        ];
        let corrections = heating_cost_corrections(
            &trades,
            &exact_prices(month, Some(0.25)),
            &exact_prices(month, None),
            "Grid",
        );
        assert!((find(&corrections, "Buyer1") + 1.5).abs() < 1e-9);
        assert!((find(&corrections, "Buyer2") + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_heating_correction_leaves_local_producer_alone() {
        // A local deficit covered by a 1000 kWh import at an estimate 0.25
        // below the exact price: buyers owe 250 split by consumption, the
        // local producer is untouched.
        let month = YearMonth::of(some_period());
        let trades = vec![
            heat_trade("Grid", Action::Sell, 1000.0, 0.5, true),
            heat_trade("Buyer1", Action::Buy, 900.0, 0.5, false),
            heat_trade("Buyer2", Action::Buy, 300.0, 0.5, false),
            heat_trade("Seller", Action::Sell, 200.0, 0.5, false),
        ];
        let corrections = heating_cost_corrections(
            &trades,
            &exact_prices(month, Some(0.75)),
            &exact_prices(month, None),
            "Grid",
        );
        assert!((find(&corrections, "Buyer1") - 187.5).abs() < 1e-9);
        assert!((find(&corrections, "Buyer2") - 62.5).abs() < 1e-9);
        assert!(corrections.iter().all(|c| c.agent_guid != "Seller"));
    }

    #[test]
    fn test_electricity_correction_per_period_exact() {
        let month = YearMonth::of(some_period());
        let trades = vec![
            trade("Grid", Action::Sell, 100.0, 1.5, true),
            trade("Buyer1", Action::Buy, 75.0, 1.5, false),
            trade("Buyer2", Action::Buy, 25.0, 1.5, false),
        ];
        let exact: BTreeMap<DateTime<Utc>, Option<f64>> =
            BTreeMap::from([(some_period(), Some(1.6))]);
        let corrections = electricity_cost_corrections(&trades, &exact, "Grid");
        // 100 kWh at 0.1 under-estimate: 10 SEK, split 75/25
        assert!((find(&corrections, "Buyer1") - 7.5).abs() < 1e-9);
        assert!((find(&corrections, "Buyer2") - 2.5).abs() < 1e-9);
        assert!((find(&corrections, "Grid") + 10.0).abs() < 1e-9);
        assert_eq!(corrections[0].month, month);
        assert!(corrections.iter().all(|c| c.cost_type == ExtraCostType::ElecExtCostCorr));
    }

    #[test]
    fn test_no_discrepancy_emits_nothing() {
        let month = YearMonth::of(some_period());
        let trades = vec![
            heat_trade("Grid", Action::Sell, 10.0, 0.5, true),
            heat_trade("Buyer1", Action::Buy, 10.0, 0.5, false),
        ];
        let corrections = heating_cost_corrections(
            &trades,
            &exact_prices(month, Some(0.5)),
            &exact_prices(month, None),
            "Grid",
        );
        assert!(corrections.is_empty());
    }
}
