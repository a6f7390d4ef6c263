//! Engine error types

use crate::types::{BotId, BotStatus};
use thiserror::Error;

/// Main error type for the bot engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Bot not found: {0}")]
    BotNotFound(BotId),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Activation key not found")]
    KeyNotFound,

    #[error("Activation key already used")]
    KeyAlreadyUsed,

    #[error("Activation key cannot start this bot: {0}")]
    KeyNotUsable(String),

    #[error("Could not generate a unique activation key after {0} attempts")]
    KeyGenerationExhausted(u32),

    #[error("Bot {bot_id} cannot go from {from} to {to}")]
    InvalidTransition {
        bot_id: BotId,
        from: BotStatus,
        to: BotStatus,
    },

    #[error("Snapshot version conflict for bot {0}")]
    VersionConflict(BotId),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Bot {0} worker is not running")]
    WorkerUnavailable(BotId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decimal error: {0}")]
    Decimal(#[from] rust_decimal::Error),
}

impl EngineError {
    /// True when the error came from a unique-constraint violation
    pub fn is_unique_violation(&self) -> bool {
        match self {
            EngineError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type alias for EngineError
pub type EngineResult<T> = std::result::Result<T, EngineError>;
