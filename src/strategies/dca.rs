//! DCA Strategy Engine
//!
//! Runs one deal at a time:
//! - Base orders on a fixed schedule (`frequency`), opening or adding to the deal
//! - Safety orders on dips below the average entry, sized on a geometric ladder
//! - Take profit (optionally trailing) and stop loss close the whole position
//!
//! The engine never touches I/O. Every decision comes back as an `Action` and
//! state only changes when a fill or rejection is reported.

use super::Action;
use crate::error::{EngineError, EngineResult};
use crate::services::activity_log::ActivityAction;
use crate::types::{BotId, Fill, Frequency, Order, OrderRole, Side};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Quantity precision used when converting quote amounts to base
const QTY_DP: u32 = 8;

/// Static DCA parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaConfig {
    /// Quote amount of every base order
    pub order_amount: Decimal,
    pub frequency: Frequency,
    /// Take profit threshold in percent (3 = 3%)
    pub take_profit_pct: Decimal,
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    #[serde(default)]
    pub trailing_tp_enabled: bool,
    /// Retrace from peak profit (percentage points) that triggers the trailing sell
    #[serde(default)]
    pub trailing_tp_deviation: Decimal,
    #[serde(default)]
    pub safety_orders_enabled: bool,
    #[serde(default)]
    pub max_safety_orders: u32,
    /// Quote amount of the first safety order
    #[serde(default)]
    pub safety_order_size: Decimal,
    /// Price deviation of the first safety order in percent
    #[serde(default)]
    pub safety_order_step_pct: Decimal,
    #[serde(default = "default_scale")]
    pub safety_order_step_scale: Decimal,
    #[serde(default = "default_scale")]
    pub safety_order_volume_scale: Decimal,
}

fn default_scale() -> Decimal {
    Decimal::ONE
}

impl DcaConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.order_amount <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig("order_amount must be positive".into()));
        }
        if self.take_profit_pct <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig("take_profit_pct must be positive".into()));
        }
        if let Some(sl) = self.stop_loss_pct {
            if sl <= Decimal::ZERO || sl >= dec!(100) {
                return Err(EngineError::InvalidConfig(
                    "stop_loss_pct must be between 0 and 100".into(),
                ));
            }
        }
        if self.trailing_tp_enabled && self.trailing_tp_deviation <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "trailing_tp_deviation must be positive when trailing take profit is enabled".into(),
            ));
        }
        if self.safety_orders_enabled {
            if self.max_safety_orders == 0 {
                return Err(EngineError::InvalidConfig("max_safety_orders must be at least 1".into()));
            }
            if self.safety_order_size <= Decimal::ZERO
                || self.safety_order_step_pct <= Decimal::ZERO
                || self.safety_order_step_scale <= Decimal::ZERO
                || self.safety_order_volume_scale <= Decimal::ZERO
            {
                return Err(EngineError::InvalidConfig(
                    "safety order size, step and scales must be positive".into(),
                ));
            }
            // The deepest level must still sit above zero
            let deepest = self
                .safety_trigger_pct(self.max_safety_orders)
                .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
            if deepest >= dec!(100) {
                return Err(EngineError::InvalidConfig(format!(
                    "safety order {} would trigger {}% below average entry",
                    self.max_safety_orders, deepest
                )));
            }
            self.safety_order_amount(self.max_safety_orders)
                .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }

    /// Deviation below average entry (percent) for safety level `level` (1-indexed)
    pub fn safety_trigger_pct(&self, level: u32) -> EngineResult<Decimal> {
        let scale = pow_level(self.safety_order_step_scale, level)?;
        self.safety_order_step_pct
            .checked_mul(scale)
            .ok_or_else(|| EngineError::Strategy(format!("safety step for level {} overflows", level)))
    }

    /// Quote size of safety level `level` (1-indexed)
    pub fn safety_order_amount(&self, level: u32) -> EngineResult<Decimal> {
        let scale = pow_level(self.safety_order_volume_scale, level)?;
        self.safety_order_size
            .checked_mul(scale)
            .ok_or_else(|| EngineError::Strategy(format!("safety order size for level {} overflows", level)))
    }
}

/// `base^(level-1)` for a 1-indexed ladder level
fn pow_level(base: Decimal, level: u32) -> EngineResult<Decimal> {
    let exp = i64::from(level.saturating_sub(1));
    base.checked_powi(exp)
        .ok_or_else(|| EngineError::Strategy(format!("{}^{} overflows", base, exp)))
}

/// Runtime state of the open deal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DcaState {
    pub current_avg_price: Decimal,
    pub total_base_bought: Decimal,
    pub total_quote_spent: Decimal,
    pub active_safety_count: u32,
    pub peak_profit_pct: Decimal,
    pub deal_count: i64,
    pub last_buy_at: Option<DateTime<Utc>>,
    /// Take profit threshold crossed in this deal (trailing mode)
    pub trailing_armed: bool,
    /// Sum of every closed deal's P&L
    pub realized_pnl: Decimal,
}

impl DcaState {
    pub fn has_position(&self) -> bool {
        self.total_base_bought > Decimal::ZERO
    }

    fn reset_deal(&mut self) {
        self.current_avg_price = Decimal::ZERO;
        self.total_base_bought = Decimal::ZERO;
        self.total_quote_spent = Decimal::ZERO;
        self.active_safety_count = 0;
        self.peak_profit_pct = Decimal::ZERO;
        self.trailing_armed = false;
    }
}

/// Where the deal cycle currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealPhase {
    NewDeal,
    Accumulating,
    Closing,
}

/// Decision engine for one DCA bot
#[derive(Debug, Clone)]
pub struct DcaEngine {
    bot_id: BotId,
    config: DcaConfig,
    state: DcaState,
    /// At most one order is in flight at a time
    in_flight: Option<Order>,
    last_price: Option<Decimal>,
}

impl DcaEngine {
    pub fn new(bot_id: BotId, config: DcaConfig) -> Self {
        Self::restore(bot_id, config, DcaState::default(), None)
    }

    /// Rebuild an engine from persisted state
    pub fn restore(bot_id: BotId, config: DcaConfig, state: DcaState, in_flight: Option<Order>) -> Self {
        Self {
            bot_id,
            config,
            state,
            in_flight,
            last_price: None,
        }
    }

    pub fn config(&self) -> &DcaConfig {
        &self.config
    }

    pub fn state(&self) -> &DcaState {
        &self.state
    }

    pub fn in_flight(&self) -> Option<&Order> {
        self.in_flight.as_ref()
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn phase(&self) -> DealPhase {
        match (&self.in_flight, self.state.has_position()) {
            (Some(order), _) if order.side == Side::Sell => DealPhase::Closing,
            (_, true) => DealPhase::Accumulating,
            (_, false) => DealPhase::NewDeal,
        }
    }

    /// Evaluate a price tick
    pub fn on_tick(&mut self, price: Decimal, at: DateTime<Utc>) -> EngineResult<Vec<Action>> {
        if price <= Decimal::ZERO {
            return Err(EngineError::Strategy(format!("non-positive price {}", price)));
        }
        self.last_price = Some(price);

        if self.in_flight.is_some() {
            return Ok(Vec::new());
        }

        if self.state.has_position() {
            if let Some(actions) = self.check_exits(price)? {
                return Ok(actions);
            }
            if let Some(actions) = self.check_safety(price)? {
                return Ok(actions);
            }
        }

        let due = match self.state.last_buy_at {
            Some(last) => at - last >= self.config.frequency.min_spacing(),
            None => true,
        };
        if due {
            let qty = (self.config.order_amount / price).round_dp(QTY_DP);
            let mut order = Order::new(self.bot_id, Side::Buy, OrderRole::DcaBase, qty, price);
            // Schedule spacing is measured from the tick that placed the filled base order
            order.created_at = at;
            info!(
                "[DCA] Bot {} base order: {} @ {} (deal {})",
                self.bot_id,
                qty,
                price,
                self.state.deal_count + 1
            );
            return Ok(vec![self.submit(order)]);
        }

        Ok(Vec::new())
    }

    /// Stop loss first, then take profit (plain or trailing)
    fn check_exits(&mut self, price: Decimal) -> EngineResult<Option<Vec<Action>>> {
        let avg = self.state.current_avg_price;
        if avg <= Decimal::ZERO {
            return Err(EngineError::Strategy(format!(
                "open position with average price {}",
                avg
            )));
        }
        let profit_pct = (price - avg) / avg * dec!(100);

        if let Some(sl) = self.config.stop_loss_pct {
            let loss_pct = -profit_pct;
            if loss_pct >= sl {
                info!(
                    "[DCA] Bot {} stop loss at {:.2}% below average {}",
                    self.bot_id, loss_pct, avg
                );
                let log = Action::log(
                    ActivityAction::StopLossTriggered,
                    json!({ "price": price, "avg_price": avg, "loss_pct": loss_pct }),
                );
                let sell = self.close_position(OrderRole::DcaStopLoss, price);
                return Ok(Some(vec![log, sell]));
            }
        }

        if !self.config.trailing_tp_enabled {
            if profit_pct >= self.config.take_profit_pct {
                info!("[DCA] Bot {} take profit at +{:.2}%", self.bot_id, profit_pct);
                let log = Action::log(
                    ActivityAction::TakeProfitTriggered,
                    json!({ "price": price, "avg_price": avg, "profit_pct": profit_pct }),
                );
                let sell = self.close_position(OrderRole::DcaTakeProfit, price);
                return Ok(Some(vec![log, sell]));
            }
            return Ok(None);
        }

        if !self.state.trailing_armed && profit_pct >= self.config.take_profit_pct {
            self.state.trailing_armed = true;
            self.state.peak_profit_pct = profit_pct;
            debug!("[DCA] Bot {} trailing take profit armed at +{:.2}%", self.bot_id, profit_pct);
        }

        if self.state.trailing_armed {
            if profit_pct > self.state.peak_profit_pct {
                self.state.peak_profit_pct = profit_pct;
            }
            let retrace = self.state.peak_profit_pct - profit_pct;
            if retrace >= self.config.trailing_tp_deviation {
                info!(
                    "[DCA] Bot {} trailing take profit: peak +{:.2}%, now +{:.2}%",
                    self.bot_id, self.state.peak_profit_pct, profit_pct
                );
                let log = Action::log(
                    ActivityAction::TakeProfitTriggered,
                    json!({
                        "price": price,
                        "avg_price": avg,
                        "profit_pct": profit_pct,
                        "peak_profit_pct": self.state.peak_profit_pct,
                        "trailing": true,
                    }),
                );
                let sell = self.close_position(OrderRole::DcaTakeProfit, price);
                return Ok(Some(vec![log, sell]));
            }
        }

        Ok(None)
    }

    fn check_safety(&mut self, price: Decimal) -> EngineResult<Option<Vec<Action>>> {
        if !self.config.safety_orders_enabled
            || self.state.active_safety_count >= self.config.max_safety_orders
        {
            return Ok(None);
        }

        let level = self.state.active_safety_count + 1;
        let deviation = self.config.safety_trigger_pct(level)?;
        let trigger = self.state.current_avg_price * (Decimal::ONE - deviation / dec!(100));
        if price > trigger {
            return Ok(None);
        }

        let amount = self.config.safety_order_amount(level)?;
        let qty = (amount / price).round_dp(QTY_DP);
        info!(
            "[DCA] Bot {} safety order {} of {}: {} @ {} (trigger {})",
            self.bot_id, level, self.config.max_safety_orders, qty, price, trigger
        );
        let order = Order::new(self.bot_id, Side::Buy, OrderRole::DcaSafety, qty, price).at_safety_level(level);
        Ok(Some(vec![self.submit(order)]))
    }

    fn close_position(&mut self, role: OrderRole, price: Decimal) -> Action {
        let order = Order::new(self.bot_id, Side::Sell, role, self.state.total_base_bought, price);
        self.submit(order)
    }

    fn submit(&mut self, order: Order) -> Action {
        self.in_flight = Some(order.clone());
        Action::Submit(order)
    }

    /// Apply a fill. Fills for orders this engine is not waiting on are ignored.
    pub fn on_fill(&mut self, fill: &Fill) -> EngineResult<Vec<Action>> {
        if !self.has_open_order(&fill.order_id) {
            debug!("[DCA] Bot {} ignoring fill for unknown order {}", self.bot_id, fill.order_id);
            return Ok(Vec::new());
        }
        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(EngineError::Strategy(format!(
                "invalid fill {} @ {} for order {}",
                fill.quantity, fill.price, fill.order_id
            )));
        }
        let Some(order) = self.in_flight.take() else {
            return Ok(Vec::new());
        };

        match order.side {
            Side::Buy => self.apply_buy(&order, fill),
            Side::Sell => Ok(self.close_deal(&order, fill)),
        }
    }

    fn apply_buy(&mut self, order: &Order, fill: &Fill) -> EngineResult<Vec<Action>> {
        let state = &mut self.state;
        state.total_quote_spent += fill.quantity * fill.price;
        state.total_base_bought += fill.quantity;
        state.current_avg_price = state.total_quote_spent / state.total_base_bought;

        if order.role == OrderRole::DcaBase {
            state.last_buy_at = Some(order.created_at);
        }

        let mut actions = Vec::new();
        if order.role == OrderRole::DcaSafety {
            state.active_safety_count = (state.active_safety_count + 1).min(self.config.max_safety_orders);
            actions.push(Action::log(
                ActivityAction::SafetyOrderFilled,
                json!({
                    "safety_level": order.safety_level,
                    "price": fill.price,
                    "quantity": fill.quantity,
                    "avg_price": state.current_avg_price,
                    "active_safety_count": state.active_safety_count,
                }),
            ));
        }

        debug!(
            "[DCA] Bot {} bought {} @ {}, avg now {}",
            self.bot_id, fill.quantity, fill.price, state.current_avg_price
        );
        Ok(actions)
    }

    fn close_deal(&mut self, order: &Order, fill: &Fill) -> Vec<Action> {
        let proceeds = fill.quantity * fill.price - fill.fee;
        let pnl = proceeds - self.state.total_quote_spent;
        self.state.realized_pnl += pnl;
        self.state.deal_count += 1;

        info!(
            "[DCA] Bot {} deal {} closed ({}): pnl {}",
            self.bot_id, self.state.deal_count, order.role, pnl
        );

        let details = json!({
            "deal": self.state.deal_count,
            "reason": order.role,
            "exit_price": fill.price,
            "avg_price": self.state.current_avg_price,
            "quantity": fill.quantity,
            "quote_spent": self.state.total_quote_spent,
            "pnl": pnl,
            "safety_orders_used": self.state.active_safety_count,
        });
        self.state.reset_deal();

        vec![Action::log(ActivityAction::DealClosed, details)]
    }

    /// The in-flight order was rejected or cancelled; the deal is untouched
    pub fn on_rejected(&mut self, order_id: &str) -> Option<Order> {
        match self.in_flight.take() {
            Some(order) if order.id == order_id => Some(order),
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    pub fn has_open_order(&self, order_id: &str) -> bool {
        self.in_flight.as_ref().map_or(false, |o| o.id == order_id)
    }

    pub fn take_open_orders(&mut self) -> Vec<Order> {
        self.in_flight.take().into_iter().collect()
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.in_flight.iter().collect()
    }

    pub fn position_value(&self) -> Decimal {
        match self.last_price {
            Some(price) => self.state.total_base_bought * price,
            None => self.state.total_quote_spent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_config() -> DcaConfig {
        DcaConfig {
            order_amount: dec!(100),
            frequency: Frequency::OneHour,
            take_profit_pct: dec!(3),
            stop_loss_pct: None,
            trailing_tp_enabled: false,
            trailing_tp_deviation: Decimal::ZERO,
            safety_orders_enabled: false,
            max_safety_orders: 0,
            safety_order_size: Decimal::ZERO,
            safety_order_step_pct: Decimal::ZERO,
            safety_order_step_scale: Decimal::ONE,
            safety_order_volume_scale: Decimal::ONE,
        }
    }

    fn safety_config() -> DcaConfig {
        DcaConfig {
            safety_orders_enabled: true,
            max_safety_orders: 3,
            safety_order_size: dec!(50),
            safety_order_step_pct: dec!(2),
            safety_order_step_scale: Decimal::ONE,
            safety_order_volume_scale: dec!(1.5),
            ..base_config()
        }
    }

    fn submitted(actions: &[Action]) -> Vec<Order> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Submit(o) => Some(o.clone()),
                _ => None,
            })
            .collect()
    }

    fn fill_of(order: &Order) -> Fill {
        Fill {
            order_id: order.id.clone(),
            price: order.price,
            quantity: order.quantity,
            fee: Decimal::ZERO,
        }
    }

    #[test]
    fn test_take_profit_closes_deal() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());

        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap());
        assert_eq!(base.len(), 1);
        assert_eq!(base[0].role, OrderRole::DcaBase);
        assert_eq!(base[0].quantity, dec!(1));
        engine.on_fill(&fill_of(&base[0])).unwrap();
        assert_eq!(engine.state().current_avg_price, dec!(100));
        assert_eq!(engine.phase(), DealPhase::Accumulating);

        let tp = submitted(&engine.on_tick(dec!(103), t0 + Duration::seconds(5)).unwrap());
        assert_eq!(tp.len(), 1);
        assert_eq!(tp[0].role, OrderRole::DcaTakeProfit);
        assert_eq!(tp[0].side, Side::Sell);
        assert_eq!(tp[0].quantity, dec!(1));
        assert_eq!(engine.phase(), DealPhase::Closing);

        let actions = engine.on_fill(&fill_of(&tp[0])).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Log { action: ActivityAction::DealClosed, .. })));
        assert_eq!(engine.state().deal_count, 1);
        assert_eq!(engine.state().current_avg_price, Decimal::ZERO);
        assert_eq!(engine.state().total_base_bought, Decimal::ZERO);
        assert_eq!(engine.state().realized_pnl, dec!(3));
        assert_eq!(engine.phase(), DealPhase::NewDeal);
    }

    #[test]
    fn test_base_orders_respect_frequency() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());

        let first = submitted(&engine.on_tick(dec!(100), t0).unwrap());
        engine.on_fill(&fill_of(&first[0])).unwrap();

        assert!(engine.on_tick(dec!(100), t0 + Duration::minutes(30)).unwrap().is_empty());

        let second = submitted(&engine.on_tick(dec!(100), t0 + Duration::hours(1)).unwrap());
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].role, OrderRole::DcaBase);
    }

    #[test]
    fn test_weighted_average_matches_fills() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());
        let fills = [(dec!(100), dec!(1)), (dec!(90), dec!(2)), (dec!(95.5), dec!(0.5))];

        for (i, (price, qty)) in fills.iter().enumerate() {
            let order = submitted(
                &engine
                    .on_tick(*price, t0 + Duration::hours(i as i64 * 2))
                    .unwrap(),
            )
            .remove(0);
            engine
                .on_fill(&Fill {
                    order_id: order.id.clone(),
                    price: *price,
                    quantity: *qty,
                    fee: Decimal::ZERO,
                })
                .unwrap();
        }

        let notional: Decimal = fills.iter().map(|(p, q)| p * q).sum();
        let qty: Decimal = fills.iter().map(|(_, q)| *q).sum();
        let expected = notional / qty;
        assert!((engine.state().current_avg_price - expected).abs() < dec!(0.0000001));
        assert_eq!(engine.state().total_base_bought, qty);
    }

    #[test]
    fn test_safety_ladder_sizes() {
        let config = safety_config();
        assert_eq!(config.safety_order_amount(1).unwrap(), dec!(50));
        assert_eq!(config.safety_order_amount(2).unwrap(), dec!(75));
        assert_eq!(config.safety_order_amount(3).unwrap(), dec!(112.5));
    }

    #[test]
    fn test_safety_count_never_exceeds_max() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, safety_config());

        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        engine.on_fill(&fill_of(&base)).unwrap();

        let mut price = dec!(100);
        let mut levels = Vec::new();
        for i in 1..=10 {
            price = price * dec!(0.95);
            let orders = submitted(&engine.on_tick(price, t0 + Duration::seconds(i)).unwrap());
            for order in orders {
                assert_eq!(order.role, OrderRole::DcaSafety);
                levels.push(order.safety_level.unwrap());
                engine.on_fill(&fill_of(&order)).unwrap();
            }
            assert!(engine.state().active_safety_count <= 3);
        }

        assert_eq!(levels, vec![1, 2, 3]);
        assert_eq!(engine.state().active_safety_count, 3);
    }

    #[test]
    fn test_safety_waits_for_step() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, safety_config());
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        engine.on_fill(&fill_of(&base)).unwrap();

        // 2% step: 98.5 is not deep enough, 98 is
        assert!(engine.on_tick(dec!(98.5), t0 + Duration::seconds(1)).unwrap().is_empty());
        let safety = submitted(&engine.on_tick(dec!(98), t0 + Duration::seconds(2)).unwrap());
        assert_eq!(safety.len(), 1);
        assert_eq!(safety[0].safety_level, Some(1));
    }

    #[test]
    fn test_stop_loss_closes_at_loss() {
        let t0 = Utc::now();
        let config = DcaConfig {
            stop_loss_pct: Some(dec!(10)),
            ..base_config()
        };
        let mut engine = DcaEngine::new(1, config);
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        engine.on_fill(&fill_of(&base)).unwrap();

        assert!(engine.on_tick(dec!(91), t0 + Duration::seconds(1)).unwrap().is_empty());
        let sl = submitted(&engine.on_tick(dec!(90), t0 + Duration::seconds(2)).unwrap()).remove(0);
        assert_eq!(sl.role, OrderRole::DcaStopLoss);

        engine
            .on_fill(&Fill {
                order_id: sl.id.clone(),
                price: dec!(90),
                quantity: dec!(1),
                fee: dec!(0.09),
            })
            .unwrap();
        assert_eq!(engine.state().realized_pnl, dec!(-10.09));
        assert_eq!(engine.state().deal_count, 1);
    }

    #[test]
    fn test_trailing_take_profit_waits_for_retrace() {
        let t0 = Utc::now();
        let config = DcaConfig {
            trailing_tp_enabled: true,
            trailing_tp_deviation: dec!(1),
            ..base_config()
        };
        let mut engine = DcaEngine::new(1, config);
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        engine.on_fill(&fill_of(&base)).unwrap();

        let ts = |s| t0 + Duration::seconds(s);
        assert!(engine.on_tick(dec!(103), ts(1)).unwrap().is_empty());
        assert!(engine.state().trailing_armed);
        assert!(engine.on_tick(dec!(106), ts(2)).unwrap().is_empty());
        assert_eq!(engine.state().peak_profit_pct, dec!(6));
        // 0.5 point retrace is inside the deviation
        assert!(engine.on_tick(dec!(105.5), ts(3)).unwrap().is_empty());

        let sell = submitted(&engine.on_tick(dec!(105), ts(4)).unwrap());
        assert_eq!(sell.len(), 1);
        assert_eq!(sell[0].role, OrderRole::DcaTakeProfit);
    }

    #[test]
    fn test_duplicate_fill_is_ignored() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        let fill = fill_of(&base);

        engine.on_fill(&fill).unwrap();
        let once = engine.state().clone();
        assert!(engine.on_fill(&fill).unwrap().is_empty());
        assert_eq!(engine.state(), &once);
    }

    #[test]
    fn test_rejection_frees_in_flight_slot() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);

        assert!(engine.on_rejected("other").is_none());
        assert!(engine.has_open_order(&base.id));
        assert_eq!(engine.on_rejected(&base.id).unwrap().id, base.id);
        assert!(engine.in_flight().is_none());
        assert_eq!(engine.state().total_base_bought, Decimal::ZERO);
    }

    #[test]
    fn test_rejected_base_order_is_retried_on_next_tick() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);
        engine.on_rejected(&base.id).unwrap();
        assert!(engine.state().last_buy_at.is_none());

        let retry = submitted(&engine.on_tick(dec!(100), t0 + Duration::seconds(1)).unwrap());
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].role, OrderRole::DcaBase);

        engine.on_fill(&fill_of(&retry[0])).unwrap();
        assert_eq!(engine.state().last_buy_at, Some(t0 + Duration::seconds(1)));
    }

    #[test]
    fn test_invalid_fill_keeps_order_in_flight() {
        let t0 = Utc::now();
        let mut engine = DcaEngine::new(1, base_config());
        let base = submitted(&engine.on_tick(dec!(100), t0).unwrap()).remove(0);

        let bad = Fill {
            quantity: Decimal::ZERO,
            ..fill_of(&base)
        };
        assert!(matches!(engine.on_fill(&bad), Err(EngineError::Strategy(_))));
        assert!(engine.has_open_order(&base.id));

        engine.on_fill(&fill_of(&base)).unwrap();
        assert_eq!(engine.state().total_base_bought, dec!(1));
        assert!(engine.in_flight().is_none());
    }

    #[test]
    fn test_oversized_safety_ladder_is_rejected() {
        let config = DcaConfig {
            safety_order_size: dec!(100),
            safety_order_volume_scale: dec!(1000),
            max_safety_orders: 10,
            safety_order_step_pct: dec!(1),
            ..safety_config()
        };
        assert!(config.safety_order_amount(10).is_err());
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation() {
        assert!(base_config().validate().is_ok());
        assert!(safety_config().validate().is_ok());

        let bad = DcaConfig {
            order_amount: Decimal::ZERO,
            ..base_config()
        };
        assert!(matches!(bad.validate(), Err(EngineError::InvalidConfig(_))));

        let too_deep = DcaConfig {
            safety_order_step_pct: dec!(40),
            safety_order_step_scale: dec!(2),
            ..safety_config()
        };
        assert!(too_deep.validate().is_err());
    }
}
