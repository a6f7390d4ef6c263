//! DCA and Grid Trading Bot Engine
//!
//! Runs many independent trading bots side by side:
//!
//! 1. **DCA**: buys a fixed quote amount on a schedule, averages down with
//!    scaled safety orders and closes the deal on take profit, trailing take
//!    profit or stop loss.
//!
//! 2. **Grid**: spreads buy and sell limit orders across a price range and
//!    re-places the opposite order one level away on every fill.
//!
//! Each bot is owned by one worker task under a `Supervisor`; state is
//! persisted to SQLite after every event so bots survive restarts.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use db::Database;
pub use error::{EngineError, EngineResult};
pub use services::{ActivationService, PaperExecutor, StartBotRequest, Supervisor};
pub use strategies::{Strategy, StrategyConfig};
pub use types::{Bot, BotId, BotStatus, BotType, Fill, PriceTick};
