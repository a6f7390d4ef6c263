//! Execution error classification
//!
//! Turns exchange rejection reasons into structured errors so the retry
//! layer can tell transient failures from permanent ones.

use std::fmt;

/// Structured execution-port error types
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// Account cannot cover the order
    InsufficientFunds,
    /// Exchange does not list the trading pair
    InvalidSymbol(String),
    /// Order size below exchange minimum
    OrderSizeTooSmall,
    /// Rate limited by the exchange
    RateLimited,
    /// Request timed out before an acknowledgement
    Timeout,
    /// Network/connection error
    NetworkError(String),
    /// Exchange refused the order for another reason
    Rejected(String),
}

impl ExecutionError {
    /// Classify a free-form rejection reason
    pub fn from_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") {
            return ExecutionError::RateLimited;
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ExecutionError::Timeout;
        }

        if lower.contains("connection") || lower.contains("network") || lower.contains("unreachable") {
            return ExecutionError::NetworkError(reason.to_string());
        }

        if lower.contains("insufficient") || lower.contains("not enough") || lower.contains("balance") {
            return ExecutionError::InsufficientFunds;
        }

        if lower.contains("symbol") || lower.contains("unknown pair") || lower.contains("invalid pair") {
            return ExecutionError::InvalidSymbol(reason.to_string());
        }

        if lower.contains("size") && (lower.contains("small") || lower.contains("minimum")) {
            return ExecutionError::OrderSizeTooSmall;
        }

        ExecutionError::Rejected(reason.to_string())
    }

    /// Whether this error is retryable with exponential backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::RateLimited | ExecutionError::Timeout | ExecutionError::NetworkError(_)
        )
    }

    /// Message stored on the bot when it enters the error state
    pub fn user_message(&self) -> String {
        match self {
            ExecutionError::InsufficientFunds => "Insufficient funds to place the order.".to_string(),
            ExecutionError::InvalidSymbol(msg) => format!("Invalid trading pair: {}", msg),
            ExecutionError::OrderSizeTooSmall => "Order size is below the exchange minimum.".to_string(),
            ExecutionError::RateLimited => "Rate limited by the exchange.".to_string(),
            ExecutionError::Timeout => "Order submission timed out.".to_string(),
            ExecutionError::NetworkError(msg) => format!("Network error: {}", msg),
            ExecutionError::Rejected(msg) => format!("Order rejected: {}", msg),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ExecutionError {}
