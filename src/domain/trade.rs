use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::types::{Action, Market, Resource, YearMonth};

/// Quantities below this threshold are treated as numerical noise from the
/// solver and produce no trade row.
pub const VERY_SMALL_NUMBER: f64 = 1e-6;

/// Primal values are rounded to this many decimals before being persisted,
/// so storage levels of -1e-8 do not end up in the database.
pub const DECIMALS_TO_ROUND_TO: i32 = 6;

pub fn round_to_decimals(value: f64) -> f64 {
    let factor = 10f64.powi(DECIMALS_TO_ROUND_TO);
    (value * factor).round() / factor
}

/// One energy transfer by one agent in one hour.
///
/// `quantity_post_loss` is the energy measured at the receiving end,
/// `quantity_pre_loss` what entered the wire. A BUY is paid for pre-loss
/// energy, a SELL is compensated for post-loss energy, which makes the
/// community's books close hour by hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub period: DateTime<Utc>,
    pub agent_guid: String,
    pub action: Action,
    pub resource: Resource,
    pub quantity_post_loss: f64,
    pub quantity_pre_loss: f64,
    /// SEK/kWh. `None` where no market price is defined (heat wholesale,
    /// cooling between agents).
    pub price: Option<f64>,
    pub by_external: bool,
    pub market: Market,
    pub loss: f64,
    /// Per-kWh fee that goes to the external grid operator, recorded on
    /// external electricity buys.
    pub grid_fee_paid: f64,
    pub tax_paid: f64,
}

impl Trade {
    /// Builds a trade from a net quantity measured post-loss. Returns `None`
    /// for quantities within solver noise of zero.
    #[allow(clippy::too_many_arguments)]
    pub fn from_net_quantity(
        period: DateTime<Utc>,
        agent_guid: &str,
        action: Action,
        resource: Resource,
        net_post_loss: f64,
        price: Option<f64>,
        by_external: bool,
        market: Market,
        loss: f64,
    ) -> Option<Self> {
        if net_post_loss.abs() <= VERY_SMALL_NUMBER {
            return None;
        }
        let quantity_post_loss = net_post_loss.abs();
        let quantity_pre_loss = if loss == 0.0 {
            quantity_post_loss
        } else {
            quantity_post_loss / (1.0 - loss)
        };
        Some(Self {
            period,
            agent_guid: agent_guid.to_string(),
            action,
            resource,
            quantity_post_loss,
            quantity_pre_loss,
            price,
            by_external,
            market,
            loss,
            grid_fee_paid: 0.0,
            tax_paid: 0.0,
        })
    }

    pub fn with_fees(mut self, grid_fee_paid: f64, tax_paid: f64) -> Self {
        self.grid_fee_paid = grid_fee_paid;
        self.tax_paid = tax_paid;
        self
    }

    /// Monetary effect of the trade for the agent. Positive for a cost,
    /// negative for an income. Buyers pay for pre-loss energy, sellers are
    /// compensated for post-loss energy.
    pub fn cost(&self) -> f64 {
        let price = self.price.unwrap_or(0.0);
        match self.action {
            Action::Buy => self.quantity_pre_loss * price,
            Action::Sell => -self.quantity_post_loss * price,
        }
    }
}

/// Keys for the per-agent and community-wide time series extracted from the
/// solved model alongside the trades.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeMetadataKey {
    BatteryLevel,
    AccTankLevel,
    ShallowStorageRel,
    ShallowStorageAbs,
    DeepStorageRel,
    DeepStorageAbs,
    ShallowLoss,
    DeepLoss,
    ShallowCharge,
    FlowShallowToDeep,
    HpCoolProd,
    HpLowHeatProd,
    HpHighHeatProd,
    HeatDump,
    CoolDump,
    CmCoolProd,
    CmHeatProd,
    CmElecCons,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtraCostType {
    HeatExtCostCorr,
    ElecExtCostCorr,
}

/// A post-hoc correction attributed to an agent, reconciling the estimated
/// prices used during the simulation against the utility's exact monthly
/// tariff. Positive means the agent owes extra, negative is a refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraCost {
    pub month: YearMonth,
    pub agent_guid: String,
    pub cost_type: ExtraCostType,
    pub amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn some_period() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_tiny_quantity_produces_no_trade() {
        let trade = Trade::from_net_quantity(
            some_period(),
            "A",
            Action::Buy,
            Resource::Electricity,
            5e-7,
            Some(1.0),
            false,
            Market::Local,
            0.0,
        );
        assert!(trade.is_none());
    }

    #[test]
    fn test_loss_gross_up() {
        let trade = Trade::from_net_quantity(
            some_period(),
            "A",
            Action::Buy,
            Resource::HighTempHeat,
            95.0,
            Some(0.5),
            false,
            Market::Local,
            0.05,
        )
        .unwrap();
        assert!((trade.quantity_pre_loss - 100.0).abs() < 1e-9);
        assert!((trade.quantity_post_loss - 95.0).abs() < 1e-9);
        // The buyer pays for what entered the wire
        assert!((trade.cost() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_income_is_negative_cost() {
        let trade = Trade::from_net_quantity(
            some_period(),
            "A",
            Action::Sell,
            Resource::Electricity,
            10.0,
            Some(2.0),
            false,
            Market::Local,
            0.0,
        )
        .unwrap();
        assert!((trade.cost() + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_unpriced_trade_has_zero_cost() {
        let trade = Trade::from_net_quantity(
            some_period(),
            "A",
            Action::Buy,
            Resource::Cooling,
            3.0,
            None,
            false,
            Market::Local,
            0.05,
        )
        .unwrap();
        assert_eq!(trade.cost(), 0.0);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to_decimals(-1e-8), 0.0);
        assert_eq!(round_to_decimals(0.1234567), 0.123457);
    }
}
