//! Order execution port
//!
//! Engines never talk to an exchange directly. The worker hands orders to an
//! `OrderExecutor`; fills come back later as `Fill` events through the
//! supervisor.

use super::order_errors::ExecutionError;
use crate::types::{BotId, Fill, Order, OrderRole, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Limit order handed to the port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub bot_id: BotId,
    pub pair: String,
    pub side: Side,
    pub role: OrderRole,
    pub quantity: Decimal,
    pub price: Decimal,
}

impl OrderRequest {
    pub fn from_order(order: &Order, pair: &str) -> Self {
        Self {
            order_id: order.id.clone(),
            bot_id: order.bot_id,
            pair: pair.to_string(),
            side: order.side,
            role: order.role,
            quantity: order.quantity,
            price: order.price,
        }
    }
}

/// Connection to wherever orders are executed
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Accept an order and return the venue's reference for it. Acceptance
    /// is not a fill; fills arrive asynchronously.
    async fn submit(&self, request: &OrderRequest) -> Result<String, ExecutionError>;

    /// Best-effort cancellation
    async fn cancel(&self, exchange_ref: &str) -> Result<(), ExecutionError>;

    fn name(&self) -> &'static str;
}

/// Simulated venue that fills every order at its limit price
pub struct PaperExecutor {
    fee_rate: Decimal,
    fill_tx: mpsc::Sender<Fill>,
    /// Refs cancelled before their fill was delivered
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl PaperExecutor {
    /// Returns the executor and the stream its fills arrive on
    pub fn new(fee_rate: Decimal, capacity: usize) -> (Self, mpsc::Receiver<Fill>) {
        let (fill_tx, fill_rx) = mpsc::channel(capacity);
        let executor = Self {
            fee_rate,
            fill_tx,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        };
        (executor, fill_rx)
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn submit(&self, request: &OrderRequest) -> Result<String, ExecutionError> {
        if request.quantity <= Decimal::ZERO {
            return Err(ExecutionError::OrderSizeTooSmall);
        }
        if request.price <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!("invalid price {}", request.price)));
        }

        let exchange_ref = format!("paper-{}", Uuid::new_v4());
        let fee = (request.quantity * request.price * self.fee_rate).round_dp(8);
        let fill = Fill {
            order_id: request.order_id.clone(),
            price: request.price,
            quantity: request.quantity,
            fee,
        };

        info!(
            "[Paper] {} {} {} @ {} for bot {} ({})",
            request.side, request.quantity, request.pair, request.price, request.bot_id, request.role
        );

        // Deliver off the caller's path; the fill must never arrive synchronously
        let fill_tx = self.fill_tx.clone();
        let cancelled = self.cancelled.clone();
        let fill_ref = exchange_ref.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if cancelled.lock().await.remove(&fill_ref) {
                debug!("[Paper] {} cancelled before fill", fill_ref);
                return;
            }
            if fill_tx.send(fill).await.is_err() {
                debug!("[Paper] Fill receiver dropped, discarding fill for {}", fill_ref);
            }
        });

        Ok(exchange_ref)
    }

    async fn cancel(&self, exchange_ref: &str) -> Result<(), ExecutionError> {
        self.cancelled.lock().await.insert(exchange_ref.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
