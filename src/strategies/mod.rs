//! Strategy engines for DCA and Grid bots
//!
//! Engines are pure decision logic: they take ticks and fills and hand back
//! `Action`s for the worker to carry out.

pub mod dca;
pub mod grid;

pub use dca::{DcaConfig, DcaEngine, DcaState, DealPhase};
pub use grid::{DeferredOrder, GridConfig, GridEngine, GridLevel, GridState};

use crate::error::EngineResult;
use crate::services::activity_log::ActivityAction;
use crate::types::{BotId, BotType, Fill, Order};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What an engine wants done after a tick or fill
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Persist and send to the execution port now
    Submit(Order),
    /// Persist in the local book without sending
    Rest(Order),
    /// A resting order was crossed; send it
    Trigger(Order),
    /// Append to the activity log
    Log {
        action: ActivityAction,
        details: serde_json::Value,
    },
}

impl Action {
    pub fn log(action: ActivityAction, details: serde_json::Value) -> Self {
        Action::Log { action, details }
    }
}

/// Outcome of an execution rejection
#[derive(Debug, Clone, PartialEq)]
pub enum Rejected {
    /// Order is gone from the engine
    Dropped(Order),
    /// Order is back in the local book
    Requeued(Order),
}

/// Figures mirrored onto the bot row after every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BotFigures {
    pub invested_amount: Decimal,
    pub current_value: Decimal,
    pub total_pnl: Decimal,
}

/// Validated configuration for a new bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "bot_type", rename_all = "lowercase")]
pub enum StrategyConfig {
    Dca(DcaConfig),
    Grid(GridConfig),
}

impl StrategyConfig {
    pub fn bot_type(&self) -> BotType {
        match self {
            StrategyConfig::Dca(_) => BotType::Dca,
            StrategyConfig::Grid(_) => BotType::Grid,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            StrategyConfig::Dca(config) => config.validate(),
            StrategyConfig::Grid(config) => {
                config.validate()?;
                config.level_prices().map(|_| ())
            }
        }
    }
}

/// One bot's engine
#[derive(Debug, Clone)]
pub enum Strategy {
    Dca(DcaEngine),
    Grid(GridEngine),
}

impl Strategy {
    pub fn new(bot_id: BotId, config: StrategyConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(match config {
            StrategyConfig::Dca(config) => Strategy::Dca(DcaEngine::new(bot_id, config)),
            StrategyConfig::Grid(config) => Strategy::Grid(GridEngine::new(bot_id, config)?),
        })
    }

    pub fn bot_type(&self) -> BotType {
        match self {
            Strategy::Dca(_) => BotType::Dca,
            Strategy::Grid(_) => BotType::Grid,
        }
    }

    /// First actions after start. Grid bots lay their ladder when a price is known.
    pub fn start(&mut self, price: Option<Decimal>) -> EngineResult<Vec<Action>> {
        match self {
            Strategy::Dca(_) => Ok(Vec::new()),
            Strategy::Grid(engine) => engine.start(price),
        }
    }

    pub fn on_tick(&mut self, price: Decimal, at: DateTime<Utc>) -> EngineResult<Vec<Action>> {
        match self {
            Strategy::Dca(engine) => engine.on_tick(price, at),
            Strategy::Grid(engine) => engine.on_tick(price, at),
        }
    }

    /// Apply a fill. Unknown or already-applied order ids yield no actions.
    pub fn on_fill(&mut self, fill: &Fill) -> EngineResult<Vec<Action>> {
        match self {
            Strategy::Dca(engine) => engine.on_fill(fill),
            Strategy::Grid(engine) => engine.on_fill(fill),
        }
    }

    pub fn on_rejected(&mut self, order_id: &str) -> Option<Rejected> {
        match self {
            Strategy::Dca(engine) => engine.on_rejected(order_id).map(Rejected::Dropped),
            Strategy::Grid(engine) => engine.on_rejected(order_id),
        }
    }

    pub fn has_open_order(&self, order_id: &str) -> bool {
        match self {
            Strategy::Dca(engine) => engine.has_open_order(order_id),
            Strategy::Grid(engine) => engine.has_open_order(order_id),
        }
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        match self {
            Strategy::Dca(engine) => engine.open_orders(),
            Strategy::Grid(engine) => engine.open_orders(),
        }
    }

    /// Drop every open order from the engine, returning them for cancellation
    pub fn take_open_orders(&mut self) -> Vec<Order> {
        match self {
            Strategy::Dca(engine) => engine.take_open_orders(),
            Strategy::Grid(engine) => engine.take_open_orders(),
        }
    }

    pub fn figures(&self) -> BotFigures {
        match self {
            Strategy::Dca(engine) => {
                let state = engine.state();
                let current_value = engine.position_value();
                BotFigures {
                    invested_amount: state.total_quote_spent,
                    current_value,
                    total_pnl: state.realized_pnl + current_value - state.total_quote_spent,
                }
            }
            Strategy::Grid(engine) => {
                let config = engine.config();
                let state = engine.state();
                BotFigures {
                    invested_amount: config.total_investment,
                    current_value: config.total_investment + state.grid_profit + state.float_pnl,
                    total_pnl: state.grid_profit,
                }
            }
        }
    }
}
