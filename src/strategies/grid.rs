//! Grid Strategy Engine
//!
//! Lays a ladder of price levels across `[lower_price, upper_price]` and
//! cycles each level:
//! - A filled buy at level `i` places a resting sell at `i + 1`
//! - A filled sell at level `i` places a resting buy at `i - 1`
//!
//! Resting orders live in the bot's local book and are only sent to the
//! execution port once the price crosses their level. A tick that jumps
//! several levels triggers every crossed level in the direction of travel.

use super::{Action, Rejected};
use crate::error::{EngineError, EngineResult};
use crate::services::activity_log::ActivityAction;
use crate::types::{BotId, Fill, GridStrategy, GridType, Order, OrderRole, Side};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

const QTY_DP: u32 = 8;
const PRICE_DP: u32 = 8;

/// Static grid parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub grid_count: u32,
    pub grid_type: GridType,
    pub total_investment: Decimal,
    pub strategy: GridStrategy,
    #[serde(default)]
    pub stop_upper_price: Option<Decimal>,
    #[serde(default)]
    pub stop_lower_price: Option<Decimal>,
}

impl GridConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.lower_price <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig("lower_price must be positive".into()));
        }
        if self.lower_price >= self.upper_price {
            return Err(EngineError::InvalidConfig(format!(
                "lower_price {} must be below upper_price {}",
                self.lower_price, self.upper_price
            )));
        }
        if self.grid_count < 3 {
            return Err(EngineError::InvalidConfig(format!(
                "grid_count must be at least 3, got {}",
                self.grid_count
            )));
        }
        if self.total_investment <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig("total_investment must be positive".into()));
        }
        if let Some(stop_upper) = self.stop_upper_price {
            if stop_upper < self.upper_price {
                return Err(EngineError::InvalidConfig(
                    "stop_upper_price must not be below upper_price".into(),
                ));
            }
        }
        if let Some(stop_lower) = self.stop_lower_price {
            if stop_lower > self.lower_price || stop_lower < Decimal::ZERO {
                return Err(EngineError::InvalidConfig(
                    "stop_lower_price must be between 0 and lower_price".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn per_grid_amount(&self) -> Decimal {
        self.total_investment / Decimal::from(self.grid_count)
    }

    /// Price of every level, ascending
    pub fn level_prices(&self) -> EngineResult<Vec<Decimal>> {
        let n = Decimal::from(self.grid_count);
        let mut prices = Vec::with_capacity(self.grid_count as usize);

        for i in 0..self.grid_count {
            let i = Decimal::from(i);
            let price = match self.grid_type {
                GridType::Arithmetic => {
                    self.lower_price + (self.upper_price - self.lower_price) * i / n
                }
                GridType::Geometric => {
                    let ratio = self.upper_price / self.lower_price;
                    let factor = ratio.checked_powd(i / n).ok_or_else(|| {
                        EngineError::Strategy(format!("geometric level {} overflows", i))
                    })?;
                    self.lower_price * factor
                }
            };
            prices.push(price.round_dp(PRICE_DP));
        }

        if prices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EngineError::InvalidConfig(
                "grid range too narrow for the requested grid_count".into(),
            ));
        }
        Ok(prices)
    }
}

/// A placement that was blocked because its level already had an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredOrder {
    pub side: Side,
    pub quantity: Decimal,
}

/// One price point of the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub level_index: u32,
    pub price: Decimal,
    pub buy_filled: bool,
    pub sell_filled: bool,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    #[serde(default)]
    pub deferred: Option<DeferredOrder>,
}

impl GridLevel {
    fn new(level_index: u32, price: Decimal) -> Self {
        Self {
            level_index,
            price,
            buy_filled: false,
            sell_filled: false,
            buy_order_id: None,
            sell_order_id: None,
            deferred: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.buy_order_id.is_some() || self.sell_order_id.is_some()
    }

    fn clear_order(&mut self, order_id: &str) {
        if self.buy_order_id.as_deref() == Some(order_id) {
            self.buy_order_id = None;
        }
        if self.sell_order_id.as_deref() == Some(order_id) {
            self.sell_order_id = None;
        }
    }
}

/// Runtime grid figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    /// Realized profit net of fees
    pub grid_profit: Decimal,
    /// Unrealized P&L of the held position at the last price
    pub float_pnl: Decimal,
    /// Signed base position; negative while a short ladder is open
    pub total_base_held: Decimal,
    /// Average entry of the held position
    pub avg_buy_price: Decimal,
    pub completed_cycles: i64,
    pub boundary_breached: bool,
    pub ladder_built: bool,
    pub last_price: Option<Decimal>,
}

/// Decision engine for one grid bot
#[derive(Debug, Clone)]
pub struct GridEngine {
    bot_id: BotId,
    config: GridConfig,
    state: GridState,
    levels: Vec<GridLevel>,
    /// Open orders, resting or submitted
    orders: Vec<Order>,
}

impl GridEngine {
    pub fn new(bot_id: BotId, config: GridConfig) -> EngineResult<Self> {
        let levels = config
            .level_prices()?
            .into_iter()
            .enumerate()
            .map(|(i, price)| GridLevel::new(i as u32, price))
            .collect();
        Ok(Self {
            bot_id,
            config,
            state: GridState::default(),
            levels,
            orders: Vec::new(),
        })
    }

    /// Rebuild an engine from persisted state
    pub fn restore(
        bot_id: BotId,
        config: GridConfig,
        state: GridState,
        levels: Vec<GridLevel>,
        orders: Vec<Order>,
    ) -> EngineResult<Self> {
        if levels.len() != config.grid_count as usize {
            return Err(EngineError::Strategy(format!(
                "bot {} has {} persisted levels, expected {}",
                bot_id,
                levels.len(),
                config.grid_count
            )));
        }
        Ok(Self {
            bot_id,
            config,
            state,
            levels,
            orders,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    /// Build the ladder if the current price is already known
    pub fn start(&mut self, price: Option<Decimal>) -> EngineResult<Vec<Action>> {
        match price {
            Some(price) if !self.state.ladder_built => self.on_tick(price, Utc::now()),
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_tick(&mut self, price: Decimal, _at: DateTime<Utc>) -> EngineResult<Vec<Action>> {
        if price <= Decimal::ZERO {
            return Err(EngineError::Strategy(format!("non-positive price {}", price)));
        }
        self.state.last_price = Some(price);
        self.update_float_pnl();

        let mut actions = Vec::new();

        if !self.state.boundary_breached && self.breaches_stop(price) {
            self.state.boundary_breached = true;
            warn!(
                "[Grid] Bot {} price {} breached stop bounds, no new orders will be placed",
                self.bot_id, price
            );
            actions.push(Action::log(
                ActivityAction::BoundaryBreach,
                json!({
                    "price": price,
                    "stop_upper_price": self.config.stop_upper_price,
                    "stop_lower_price": self.config.stop_lower_price,
                }),
            ));
        }

        if !self.state.ladder_built {
            if self.state.boundary_breached {
                return Ok(actions);
            }
            self.build_ladder(price, &mut actions);
        }

        self.trigger_crossed(price, &mut actions);
        Ok(actions)
    }

    fn breaches_stop(&self, price: Decimal) -> bool {
        self.config.stop_upper_price.map_or(false, |u| price >= u)
            || self.config.stop_lower_price.map_or(false, |l| price <= l)
    }

    fn build_ladder(&mut self, price: Decimal, actions: &mut Vec<Action>) {
        let per_grid = self.config.per_grid_amount();
        let mut placed = 0;

        for i in 0..self.levels.len() {
            let level_price = self.levels[i].price;
            let side = match self.config.strategy {
                GridStrategy::Short if level_price > price => Side::Sell,
                GridStrategy::Neutral | GridStrategy::Long if level_price < price => Side::Buy,
                _ => continue,
            };
            let qty = (per_grid / level_price).round_dp(QTY_DP);
            if let Some(action) = self.place(i, side, qty) {
                actions.push(action);
                placed += 1;
            }
        }

        self.state.ladder_built = true;
        info!(
            "[Grid] Bot {} ladder built at {}: {} levels, {} resting orders",
            self.bot_id,
            price,
            self.levels.len(),
            placed
        );
        actions.push(Action::log(
            ActivityAction::LadderBuilt,
            json!({
                "price": price,
                "levels": self.levels.iter().map(|l| l.price).collect::<Vec<_>>(),
                "resting_orders": placed,
                "strategy": self.config.strategy,
            }),
        ));
    }

    /// Put a resting order on level `index`, or defer it while the level is busy
    fn place(&mut self, index: usize, side: Side, quantity: Decimal) -> Option<Action> {
        let level = &mut self.levels[index];
        if level.is_busy() {
            debug!(
                "[Grid] Bot {} level {} busy, deferring {} {}",
                self.bot_id, index, side, quantity
            );
            level.deferred = Some(DeferredOrder { side, quantity });
            return None;
        }

        let role = match side {
            Side::Buy => OrderRole::GridBuy,
            Side::Sell => OrderRole::GridSell,
        };
        let order = Order::new(self.bot_id, side, role, quantity, level.price).at_grid_level(index as u32);
        match side {
            Side::Buy => level.buy_order_id = Some(order.id.clone()),
            Side::Sell => level.sell_order_id = Some(order.id.clone()),
        }
        self.orders.push(order.clone());
        Some(Action::Rest(order))
    }

    /// Send every resting order the price has crossed, nearest level first
    fn trigger_crossed(&mut self, price: Decimal, actions: &mut Vec<Action>) {
        let mut buys: Vec<usize> = Vec::new();
        let mut sells: Vec<usize> = Vec::new();
        for (idx, order) in self.orders.iter().enumerate() {
            if order.submitted {
                continue;
            }
            match order.side {
                Side::Buy if price <= order.price => buys.push(idx),
                Side::Sell if price >= order.price => sells.push(idx),
                _ => {}
            }
        }
        // Falling price walks down through buys, rising price walks up through sells
        buys.sort_by(|a, b| self.orders[*b].price.cmp(&self.orders[*a].price));
        sells.sort_by(|a, b| self.orders[*a].price.cmp(&self.orders[*b].price));

        let mut sellable = if self.config.strategy == GridStrategy::Long {
            let committed: Decimal = self
                .orders
                .iter()
                .filter(|o| o.submitted && o.side == Side::Sell)
                .map(|o| o.quantity)
                .sum();
            Some(self.state.total_base_held - committed)
        } else {
            None
        };

        for idx in buys {
            self.orders[idx].submitted = true;
            actions.push(Action::Trigger(self.orders[idx].clone()));
        }

        for idx in sells {
            if let Some(available) = sellable.as_mut() {
                if self.orders[idx].quantity > *available {
                    debug!(
                        "[Grid] Bot {} skipping sell at level {:?}: holds {} of {}",
                        self.bot_id, self.orders[idx].grid_level, available, self.orders[idx].quantity
                    );
                    continue;
                }
                *available -= self.orders[idx].quantity;
            }
            self.orders[idx].submitted = true;
            actions.push(Action::Trigger(self.orders[idx].clone()));
        }
    }

    pub fn on_fill(&mut self, fill: &Fill) -> EngineResult<Vec<Action>> {
        let Some(pos) = self.orders.iter().position(|o| o.id == fill.order_id) else {
            debug!("[Grid] Bot {} ignoring fill for unknown order {}", self.bot_id, fill.order_id);
            return Ok(Vec::new());
        };
        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(EngineError::Strategy(format!(
                "invalid fill {} @ {} for order {}",
                fill.quantity, fill.price, fill.order_id
            )));
        }

        let order = self.orders.remove(pos);
        let index = order
            .grid_level
            .map(|l| l as usize)
            .filter(|l| *l < self.levels.len())
            .ok_or_else(|| EngineError::Strategy(format!("order {} has no grid level", order.id)))?;

        {
            let level = &mut self.levels[index];
            level.clear_order(&order.id);
            match order.side {
                Side::Buy => {
                    level.buy_filled = true;
                    level.sell_filled = false;
                }
                Side::Sell => {
                    level.sell_filled = true;
                    level.buy_filled = false;
                }
            }
        }

        let (realized, closed) = self.apply_position(order.side, fill.quantity, fill.price);
        self.state.grid_profit += realized - fill.fee;
        if closed {
            self.state.completed_cycles += 1;
        }
        self.update_float_pnl();

        info!(
            "[Grid] Bot {} level {} {} filled: {} @ {} (realized {}, held {})",
            self.bot_id, index, order.side, fill.quantity, fill.price, realized, self.state.total_base_held
        );

        let mut actions = vec![Action::log(
            ActivityAction::GridLevelFilled,
            json!({
                "level": index,
                "side": order.side,
                "price": fill.price,
                "quantity": fill.quantity,
                "fee": fill.fee,
                "realized": realized,
                "grid_profit": self.state.grid_profit,
                "total_base_held": self.state.total_base_held,
            }),
        )];

        if !self.state.boundary_breached {
            let next = match order.side {
                Side::Buy if index + 1 < self.levels.len() => Some((index + 1, Side::Sell)),
                Side::Sell if index >= 1 => Some((index - 1, Side::Buy)),
                _ => None,
            };
            if let Some((target, side)) = next {
                actions.extend(self.place(target, side, fill.quantity));
            }
            if let Some(deferred) = self.levels[index].deferred.take() {
                actions.extend(self.place(index, deferred.side, deferred.quantity));
            }
        }

        Ok(actions)
    }

    /// Apply a fill to the signed position. Returns realized P&L and whether
    /// the fill reduced an existing position.
    fn apply_position(&mut self, side: Side, qty: Decimal, price: Decimal) -> (Decimal, bool) {
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let held = self.state.total_base_held;
        let new_held = held + signed;

        let adding = held.is_zero() || (held > Decimal::ZERO) == (signed > Decimal::ZERO);
        if adding {
            self.state.avg_buy_price =
                (self.state.avg_buy_price * held.abs() + price * qty) / new_held.abs();
            self.state.total_base_held = new_held;
            return (Decimal::ZERO, false);
        }

        let closing = qty.min(held.abs());
        let realized = if held > Decimal::ZERO {
            (price - self.state.avg_buy_price) * closing
        } else {
            (self.state.avg_buy_price - price) * closing
        };

        if new_held.is_zero() {
            self.state.avg_buy_price = Decimal::ZERO;
        } else if (new_held > Decimal::ZERO) != (held > Decimal::ZERO) {
            // Position flipped; the remainder opened at this price
            self.state.avg_buy_price = price;
        }
        self.state.total_base_held = new_held;
        (realized, true)
    }

    fn update_float_pnl(&mut self) {
        if let Some(price) = self.state.last_price {
            self.state.float_pnl = (price - self.state.avg_buy_price) * self.state.total_base_held;
        }
    }

    /// A submitted order was rejected. It goes back to resting so it can
    /// trigger again once the bot is resumed.
    pub fn on_rejected(&mut self, order_id: &str) -> Option<Rejected> {
        let pos = self.orders.iter().position(|o| o.id == order_id)?;
        if self.orders[pos].submitted {
            self.orders[pos].submitted = false;
            return Some(Rejected::Requeued(self.orders[pos].clone()));
        }
        let order = self.orders.remove(pos);
        if let Some(level) = order.grid_level.and_then(|l| self.levels.get_mut(l as usize)) {
            level.clear_order(&order.id);
        }
        Some(Rejected::Dropped(order))
    }

    pub fn has_open_order(&self, order_id: &str) -> bool {
        self.orders.iter().any(|o| o.id == order_id)
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.iter().collect()
    }

    /// Remove every open order from the book and free all levels
    pub fn take_open_orders(&mut self) -> Vec<Order> {
        for level in &mut self.levels {
            level.buy_order_id = None;
            level.sell_order_id = None;
            level.deferred = None;
        }
        std::mem::take(&mut self.orders)
    }
}
