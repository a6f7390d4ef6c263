//! Core types for the bot engine

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type BotId = i64;

/// Declares a fieldless enum stored as a lowercase string in the database.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::EngineError::Parse(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum!(
    /// Which strategy engine drives a bot
    BotType { Dca => "dca", Grid => "grid" }
);

string_enum!(
    /// Bot lifecycle status
    BotStatus {
        Running => "running",
        Paused => "paused",
        Stopped => "stopped",
        Error => "error",
    }
);

impl BotStatus {
    /// Lifecycle edges a bot may take. `stopped` is terminal.
    pub fn can_transition_to(&self, to: BotStatus) -> bool {
        use BotStatus::*;
        matches!(
            (self, to),
            (Running, Paused)
                | (Paused, Running)
                | (Error, Running)
                | (Running, Error)
                | (Paused, Error)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Error, Stopped)
        )
    }

    /// Whether a worker should exist for a bot in this status
    pub fn is_active(&self) -> bool {
        !matches!(self, BotStatus::Stopped)
    }
}

string_enum!(Side { Buy => "buy", Sell => "sell" });

string_enum!(
    /// Why an order was placed
    OrderRole {
        DcaBase => "dca_base",
        DcaSafety => "dca_safety",
        DcaTakeProfit => "dca_take_profit",
        DcaStopLoss => "dca_stop_loss",
        GridBuy => "grid_buy",
        GridSell => "grid_sell",
    }
);

string_enum!(
    OrderStatus {
        Pending => "pending",
        Filled => "filled",
        Cancelled => "cancelled",
    }
);

string_enum!(
    /// Minimum spacing between DCA base orders
    Frequency {
        OneMinute => "1m",
        FiveMinutes => "5m",
        FifteenMinutes => "15m",
        OneHour => "1h",
        FourHours => "4h",
        TwelveHours => "12h",
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
    }
);

impl Frequency {
    pub fn min_spacing(&self) -> Duration {
        match self {
            Frequency::OneMinute => Duration::minutes(1),
            Frequency::FiveMinutes => Duration::minutes(5),
            Frequency::FifteenMinutes => Duration::minutes(15),
            Frequency::OneHour => Duration::hours(1),
            Frequency::FourHours => Duration::hours(4),
            Frequency::TwelveHours => Duration::hours(12),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
            // Calendar months vary; a fixed 30 days keeps spacing deterministic
            Frequency::Monthly => Duration::days(30),
        }
    }
}

string_enum!(GridType { Arithmetic => "arithmetic", Geometric => "geometric" });

string_enum!(
    GridStrategy {
        Neutral => "neutral",
        Long => "long",
        Short => "short",
    }
);

string_enum!(
    /// Lifecycle of an activation key
    KeyStatus {
        Unused => "unused",
        Active => "active",
        Revoked => "revoked",
    }
);

/// A persisted bot row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub user_id: String,
    pub name: String,
    pub bot_type: BotType,
    pub pair: String,
    pub status: BotStatus,
    pub invested_amount: Decimal,
    pub current_value: Decimal,
    pub total_pnl: Decimal,
    pub trade_count: i64,
    pub error_message: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An order created by a strategy engine.
///
/// Grid orders rest in the bot's local book (`submitted == false`) until
/// the price crosses their level; DCA orders are submitted immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub bot_id: BotId,
    pub side: Side,
    pub role: OrderRole,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total: Decimal,
    pub fee: Decimal,
    pub status: OrderStatus,
    pub grid_level: Option<u32>,
    pub safety_level: Option<u32>,
    pub submitted: bool,
    pub exchange_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(bot_id: BotId, side: Side, role: OrderRole, quantity: Decimal, price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bot_id,
            side,
            role,
            quantity,
            price,
            total: quantity * price,
            fee: Decimal::ZERO,
            status: OrderStatus::Pending,
            grid_level: None,
            safety_level: None,
            submitted: false,
            exchange_ref: None,
            created_at: Utc::now(),
            filled_at: None,
        }
    }

    pub fn at_grid_level(mut self, level: u32) -> Self {
        self.grid_level = Some(level);
        self
    }

    pub fn at_safety_level(mut self, level: u32) -> Self {
        self.safety_level = Some(level);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// A single price observation for a trading pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub pair: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Fill confirmation from the execution port (fill-or-nothing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub fee: Decimal,
}

/// Immutable activity log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub bot_id: Option<BotId>,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Activation key row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationKey {
    pub key: String,
    pub bot_type: BotType,
    pub status: KeyStatus,
    pub created_by: String,
    pub notes: Option<String>,
    pub redeemed_by: Option<String>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub bot_id: Option<BotId>,
    pub created_at: DateTime<Utc>,
}
