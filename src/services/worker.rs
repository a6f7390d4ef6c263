//! Per-bot worker
//!
//! Each active bot is owned by exactly one worker task. The worker consumes
//! price ticks from the shared broadcast and fills, port acknowledgements and
//! commands from its own bounded queue, one event at a time. It is the only
//! writer of its bot's runtime state.

use super::activity_log::{ActivityAction, ActivityLog};
use super::execution::{OrderExecutor, OrderRequest};
use super::metrics::Metrics;
use super::order_errors::ExecutionError;
use super::retry::submit_with_retry;
use crate::config::SupervisorConfig;
use crate::db::{Database, OrderUpdate, Snapshot};
use crate::error::{EngineError, EngineResult};
use crate::strategies::{Action, Rejected, Strategy};
use crate::types::{Bot, BotId, BotStatus, Fill, Order, PriceTick};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type CommandReply = oneshot::Sender<EngineResult<()>>;

/// Operator commands
#[derive(Debug)]
pub enum BotCommand {
    Pause(CommandReply),
    Resume(CommandReply),
    Stop(CommandReply),
    /// Exit the loop without changing status (supervisor shutdown)
    Shutdown,
}

/// Everything that arrives on a worker's queue
#[derive(Debug)]
pub enum BotEvent {
    Fill(Fill),
    /// The port accepted an order
    Accepted { order_id: String, exchange_ref: String },
    /// The port refused an order after `attempts` calls
    Rejected {
        order_id: String,
        error: ExecutionError,
        attempts: u32,
    },
    Command(BotCommand),
}

/// Shared dependencies handed to every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub executor: Arc<dyn OrderExecutor>,
    pub config: SupervisorConfig,
    pub metrics: Metrics,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct BotWorker {
    bot_id: BotId,
    pair: String,
    status: BotStatus,
    version: i64,
    strategy: Strategy,
    ctx: WorkerContext,
    activity: ActivityLog,
    /// Own queue, used by spawned port calls to report back
    events_tx: mpsc::Sender<BotEvent>,
    /// order id -> venue reference, for cancellation
    exchange_refs: HashMap<String, String>,
    max_tick_age: Option<chrono::Duration>,
    last_tick_at: Option<DateTime<Utc>>,
    last_tick_seen: Instant,
    stale_feed_warned: bool,
    stale_tick_warned: bool,
    /// Start-up submissions, sent once the loop runs
    held: Vec<Order>,
}

impl BotWorker {
    pub fn new(bot: &Bot, strategy: Strategy, ctx: WorkerContext, events_tx: mpsc::Sender<BotEvent>) -> Self {
        let exchange_refs = strategy
            .open_orders()
            .into_iter()
            .filter_map(|o| o.exchange_ref.clone().map(|r| (o.id.clone(), r)))
            .collect();
        let max_tick_age = ctx
            .config
            .max_tick_age
            .and_then(|age| chrono::Duration::from_std(age).ok());

        Self {
            bot_id: bot.id,
            pair: bot.pair.clone(),
            status: bot.status,
            version: bot.version,
            strategy,
            activity: ActivityLog::new(ctx.db.clone()),
            ctx,
            events_tx,
            exchange_refs,
            max_tick_age,
            last_tick_at: None,
            last_tick_seen: Instant::now(),
            stale_feed_warned: false,
            stale_tick_warned: false,
            held: Vec::new(),
        }
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    /// Persist the engine's start-up actions (grid ladder) before the loop
    /// starts. Orders they submit go to the port from `run`.
    pub async fn start(&mut self, price: Option<Decimal>) -> EngineResult<()> {
        let mut next = self.strategy.clone();
        let actions = next.start(price)?;
        if actions.is_empty() {
            self.strategy = next;
            return Ok(());
        }
        self.held = self.store(next, actions, Vec::new(), Vec::new(), 0).await?;
        Ok(())
    }

    /// Event loop. Queue events take priority over ticks.
    pub async fn run(mut self, mut events: mpsc::Receiver<BotEvent>, ticks: broadcast::Receiver<PriceTick>) {
        let mut ticks = Some(ticks);
        let mut watchdog = tokio::time::interval(self.ctx.config.stale_feed_after);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First interval tick fires immediately
        watchdog.tick().await;

        info!("[Worker] Bot {} ({} on {}) running, status {}", self.bot_id, self.strategy.bot_type(), self.pair, self.status);
        for order in std::mem::take(&mut self.held) {
            self.send_to_port(order);
        }

        loop {
            tokio::select! {
                biased;

                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_event(event).await == Flow::Exit {
                        break;
                    }
                }

                tick = recv_tick(&mut ticks) => match tick {
                    Ok(tick) => self.on_tick(tick).await,
                    Err(RecvError::Lagged(skipped)) => {
                        self.ctx.metrics.add_ticks_dropped(skipped);
                        warn!("[Worker] Bot {} lagged behind the price feed, {} ticks dropped", self.bot_id, skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("[Worker] Bot {} price broadcast closed", self.bot_id);
                        ticks = None;
                    }
                },

                _ = watchdog.tick() => self.check_stale_feed().await,
            }
        }

        debug!("[Worker] Bot {} loop exited", self.bot_id);
    }

    async fn handle_event(&mut self, event: BotEvent) -> Flow {
        match event {
            BotEvent::Fill(fill) => self.on_fill(fill).await,
            BotEvent::Accepted { order_id, exchange_ref } => self.on_accepted(order_id, exchange_ref).await,
            BotEvent::Rejected {
                order_id,
                error,
                attempts,
            } => self.on_rejected(order_id, error, attempts).await,
            BotEvent::Command(BotCommand::Pause(reply)) => {
                let result = self
                    .transition(BotStatus::Paused, None, ActivityAction::BotPaused)
                    .await;
                let _ = reply.send(result);
            }
            BotEvent::Command(BotCommand::Resume(reply)) => {
                let result = self
                    .transition(BotStatus::Running, None, ActivityAction::BotResumed)
                    .await;
                if result.is_ok() {
                    self.last_tick_seen = Instant::now();
                    self.stale_feed_warned = false;
                }
                let _ = reply.send(result);
            }
            BotEvent::Command(BotCommand::Stop(reply)) => {
                let result = self.stop().await;
                let exit = result.is_ok();
                let _ = reply.send(result);
                if exit {
                    return Flow::Exit;
                }
            }
            BotEvent::Command(BotCommand::Shutdown) => {
                // Capture figures that moved with ticks since the last write
                if let Err(e) = self.persist(None, Vec::new(), Vec::new(), 0, None).await {
                    warn!("[Worker] Bot {} final snapshot failed: {}", self.bot_id, e);
                }
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    // ==================== TICKS ====================

    async fn on_tick(&mut self, tick: PriceTick) {
        if tick.pair != self.pair || self.status != BotStatus::Running {
            return;
        }

        if let Some(last) = self.last_tick_at {
            if tick.timestamp <= last {
                self.ctx.metrics.add_ticks_dropped(1);
                debug!("[Worker] Bot {} dropping out-of-order tick {} <= {}", self.bot_id, tick.timestamp, last);
                return;
            }
        }

        if let Some(max_age) = self.max_tick_age {
            let age = Utc::now() - tick.timestamp;
            if age > max_age {
                self.ctx.metrics.add_ticks_dropped(1);
                if !self.stale_tick_warned {
                    self.stale_tick_warned = true;
                    warn!(
                        "[Worker] Bot {} ignoring stale {} tick ({}s old), holding until fresh prices arrive",
                        self.bot_id,
                        self.pair,
                        age.num_seconds()
                    );
                    self.activity
                        .record_best_effort(
                            Some(self.bot_id),
                            ActivityAction::StaleFeed,
                            json!({ "reason": "stale_tick", "tick_at": tick.timestamp, "age_secs": age.num_seconds() }),
                        )
                        .await;
                }
                return;
            }
        }

        self.last_tick_at = Some(tick.timestamp);
        self.last_tick_seen = Instant::now();
        self.stale_feed_warned = false;
        self.stale_tick_warned = false;

        // The engine only advances once its decision is stored
        let mut next = self.strategy.clone();
        match next.on_tick(tick.price, tick.timestamp) {
            Ok(actions) if actions.is_empty() => self.strategy = next,
            Ok(actions) => {
                if let Err(e) = self.commit(next, actions, Vec::new(), Vec::new(), 0).await {
                    self.fail(format!("failed to persist tick decision: {}", e)).await;
                }
            }
            Err(e) => self.fail(e.to_string()).await,
        }
    }

    async fn check_stale_feed(&mut self) {
        if self.status != BotStatus::Running || self.stale_feed_warned {
            return;
        }
        let silent = self.last_tick_seen.elapsed();
        if silent < self.ctx.config.stale_feed_after {
            return;
        }
        self.stale_feed_warned = true;
        warn!(
            "[Worker] Bot {} has had no {} price for {}s, taking no action",
            self.bot_id,
            self.pair,
            silent.as_secs()
        );
        self.activity
            .record_best_effort(
                Some(self.bot_id),
                ActivityAction::StaleFeed,
                json!({ "reason": "no_ticks", "silent_secs": silent.as_secs() }),
            )
            .await;
    }

    // ==================== FILLS & PORT CALLBACKS ====================

    async fn on_fill(&mut self, fill: Fill) {
        let Some(order) = self
            .strategy
            .open_orders()
            .into_iter()
            .find(|o| o.id == fill.order_id)
            .cloned()
        else {
            debug!("[Worker] Bot {} ignoring duplicate or unknown fill {}", self.bot_id, fill.order_id);
            return;
        };

        let mut next = self.strategy.clone();
        let actions = match next.on_fill(&fill) {
            Ok(actions) => actions,
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };

        info!(
            "[Worker] Bot {} {} {} filled: {} @ {} (fee {})",
            self.bot_id, order.role, order.side, fill.quantity, fill.price, fill.fee
        );

        let updates = vec![OrderUpdate::Filled {
            order_id: fill.order_id.clone(),
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            filled_at: Utc::now(),
        }];
        let activity = vec![(
            ActivityAction::OrderFilled,
            json!({
                "order_id": fill.order_id,
                "side": order.side,
                "role": order.role,
                "price": fill.price,
                "quantity": fill.quantity,
                "fee": fill.fee,
                "grid_level": order.grid_level,
                "safety_level": order.safety_level,
            }),
        )];

        match self.commit(next, actions, updates, activity, 1).await {
            Ok(()) => {
                self.ctx.metrics.inc_orders_filled();
                self.exchange_refs.remove(&fill.order_id);
            }
            Err(e) => self.fail(format!("failed to persist fill {}: {}", fill.order_id, e)).await,
        }
    }

    async fn on_accepted(&mut self, order_id: String, exchange_ref: String) {
        debug!("[Worker] Bot {} order {} accepted as {}", self.bot_id, order_id, exchange_ref);
        if let Err(e) = self.ctx.db.set_exchange_ref(&order_id, &exchange_ref).await {
            warn!("[Worker] Bot {} failed to record exchange ref for {}: {}", self.bot_id, order_id, e);
        }
        if self.strategy.has_open_order(&order_id) {
            self.exchange_refs.insert(order_id, exchange_ref);
        }
    }

    async fn on_rejected(&mut self, order_id: String, error: ExecutionError, attempts: u32) {
        self.ctx.metrics.inc_orders_rejected();
        let mut next = self.strategy.clone();
        let Some(outcome) = next.on_rejected(&order_id) else {
            debug!("[Worker] Bot {} rejection for unknown order {}", self.bot_id, order_id);
            return;
        };

        let message = error.user_message();
        warn!(
            "[Worker] Bot {} order {} rejected after {} attempt(s): {}",
            self.bot_id, order_id, attempts, message
        );

        let update = match outcome {
            Rejected::Dropped(_) => OrderUpdate::Cancelled {
                order_id: order_id.clone(),
                error: Some(message.clone()),
            },
            Rejected::Requeued(_) => OrderUpdate::Requeued {
                order_id: order_id.clone(),
                error: message.clone(),
            },
        };
        let activity = vec![(
            ActivityAction::OrderRejected,
            json!({
                "order_id": order_id,
                "error": message,
                "retryable": error.is_retryable(),
                "attempts": attempts,
            }),
        )];

        if let Err(e) = self.persist(Some(next), vec![update], activity, 0, None).await {
            warn!("[Worker] Bot {} failed to persist rejection: {}", self.bot_id, e);
        }

        // Retries are already spent; halt automated trading until an operator resumes
        self.fail(message).await;
    }

    // ==================== ACTIONS & PERSISTENCE ====================

    /// Persist an engine decision, then hand any new submissions to the port
    async fn commit(
        &mut self,
        next: Strategy,
        actions: Vec<Action>,
        updates: Vec<OrderUpdate>,
        activity: Vec<(ActivityAction, serde_json::Value)>,
        new_trades: i64,
    ) -> EngineResult<()> {
        for order in self.store(next, actions, updates, activity, new_trades).await? {
            self.send_to_port(order);
        }
        Ok(())
    }

    /// Persist an engine decision and return the orders it submits
    async fn store(
        &mut self,
        next: Strategy,
        actions: Vec<Action>,
        mut updates: Vec<OrderUpdate>,
        mut activity: Vec<(ActivityAction, serde_json::Value)>,
        new_trades: i64,
    ) -> EngineResult<Vec<Order>> {
        let mut outgoing: Vec<Order> = Vec::new();

        for action in actions {
            match action {
                Action::Submit(mut order) => {
                    order.submitted = true;
                    activity.push((ActivityAction::OrderPlaced, order_details(&order, false)));
                    outgoing.push(order.clone());
                    updates.push(OrderUpdate::Insert(order));
                }
                Action::Rest(order) => {
                    activity.push((ActivityAction::OrderPlaced, order_details(&order, true)));
                    updates.push(OrderUpdate::Insert(order));
                }
                Action::Trigger(order) => {
                    activity.push((ActivityAction::OrderPlaced, order_details(&order, false)));
                    updates.push(OrderUpdate::Submitted {
                        order_id: order.id.clone(),
                    });
                    outgoing.push(order);
                }
                Action::Log { action, details } => activity.push((action, details)),
            }
        }

        self.persist(Some(next), updates, activity, new_trades, None).await?;
        Ok(outgoing)
    }

    /// Write a snapshot, reloading the version and retrying on conflicts.
    /// `next` replaces the live engine only once its snapshot is stored.
    async fn persist(
        &mut self,
        next: Option<Strategy>,
        updates: Vec<OrderUpdate>,
        activity: Vec<(ActivityAction, serde_json::Value)>,
        new_trades: i64,
        status: Option<(BotStatus, Option<String>)>,
    ) -> EngineResult<()> {
        let mut attempt = 0;
        let version = loop {
            let strategy = next.as_ref().unwrap_or(&self.strategy);
            let snapshot = Snapshot {
                bot_id: self.bot_id,
                strategy,
                figures: strategy.figures(),
                new_trades,
                orders: &updates,
                activity: &activity,
                status: status.clone(),
            };

            match self.ctx.db.save_snapshot(&snapshot, self.version).await {
                Ok(version) => break version,
                Err(EngineError::VersionConflict(_)) if attempt < self.ctx.config.snapshot_max_retries => {
                    attempt += 1;
                    self.ctx.metrics.inc_snapshot_conflicts();
                    let current = self.ctx.db.get_bot(self.bot_id).await?;
                    warn!(
                        "[Worker] Bot {} snapshot conflict (had v{}, now v{}), retry {}/{}",
                        self.bot_id, self.version, current.version, attempt, self.ctx.config.snapshot_max_retries
                    );
                    self.version = current.version;
                    if status.is_none() {
                        self.status = current.status;
                    }
                }
                Err(e) => return Err(e),
            }
        };

        self.version = version;
        if let Some((new_status, _)) = status {
            self.status = new_status;
        }
        if let Some(next) = next {
            self.strategy = next;
        }
        Ok(())
    }

    fn send_to_port(&self, order: Order) {
        self.ctx.metrics.inc_orders_submitted();
        let request = OrderRequest::from_order(&order, &self.pair);
        let executor = self.ctx.executor.clone();
        let policy = self.ctx.config.retry.clone();
        let metrics = self.ctx.metrics.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let submission = submit_with_retry(executor.as_ref(), &request, &policy, &metrics).await;
            let event = match submission.outcome {
                Ok(exchange_ref) => BotEvent::Accepted {
                    order_id: request.order_id.clone(),
                    exchange_ref,
                },
                Err(error) => BotEvent::Rejected {
                    order_id: request.order_id.clone(),
                    error,
                    attempts: submission.attempts,
                },
            };
            if events_tx.send(event).await.is_err() {
                debug!("[Worker] Bot {} gone before {} was acknowledged", request.bot_id, request.order_id);
            }
        });
    }

    // ==================== LIFECYCLE ====================

    async fn transition(
        &mut self,
        to: BotStatus,
        error_message: Option<String>,
        action: ActivityAction,
    ) -> EngineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                bot_id: self.bot_id,
                from: self.status,
                to,
            });
        }
        let from = self.status;
        let details = json!({ "from": from, "to": to, "error": error_message });
        self.persist(None, Vec::new(), vec![(action, details)], 0, Some((to, error_message)))
            .await?;
        info!("[Worker] Bot {} {} -> {}", self.bot_id, from, to);
        Ok(())
    }

    /// Cancel everything open and move to `stopped`. Cancellations are not awaited.
    async fn stop(&mut self) -> EngineResult<()> {
        if !self.status.can_transition_to(BotStatus::Stopped) {
            return Err(EngineError::InvalidTransition {
                bot_id: self.bot_id,
                from: self.status,
                to: BotStatus::Stopped,
            });
        }

        let mut next = self.strategy.clone();
        let open = next.take_open_orders();
        let mut updates = Vec::with_capacity(open.len());
        let mut activity = Vec::with_capacity(open.len() + 1);

        for order in &open {
            updates.push(OrderUpdate::Cancelled {
                order_id: order.id.clone(),
                error: None,
            });
            activity.push((
                ActivityAction::OrderCancelled,
                json!({ "order_id": order.id, "side": order.side, "role": order.role, "submitted": order.submitted }),
            ));
        }
        activity.push((
            ActivityAction::BotStopped,
            json!({ "from": self.status, "cancelled_orders": open.len() }),
        ));

        self.persist(Some(next), updates, activity, 0, Some((BotStatus::Stopped, None)))
            .await?;

        for order in open.iter().filter(|o| o.submitted) {
            let exchange_ref = self
                .exchange_refs
                .remove(&order.id)
                .unwrap_or_else(|| order.id.clone());
            self.cancel_on_port(exchange_ref);
        }
        self.ctx.metrics.add_orders_cancelled(open.len() as u64);
        info!("[Worker] Bot {} stopped, {} open orders cancelled", self.bot_id, open.len());
        Ok(())
    }

    fn cancel_on_port(&self, exchange_ref: String) {
        let executor = self.ctx.executor.clone();
        let bot_id = self.bot_id;
        tokio::spawn(async move {
            if let Err(e) = executor.cancel(&exchange_ref).await {
                warn!("[Worker] Bot {} cancel of {} failed: {}", bot_id, exchange_ref, e);
            }
        });
    }

    /// Move the bot to `error`. This write ignores the version so the error
    /// always lands.
    pub async fn fail(&mut self, reason: String) {
        error!("[Worker] Bot {} error: {}", self.bot_id, reason);
        self.ctx.metrics.inc_bot_errors();

        let details = json!({ "error": reason, "from": self.status });
        let status = if self.status.can_transition_to(BotStatus::Error) {
            BotStatus::Error
        } else {
            self.status
        };
        let message = (status == BotStatus::Error).then(|| reason.clone());

        match self
            .ctx
            .db
            .update_status(
                self.bot_id,
                None,
                status,
                message.as_deref(),
                Some((ActivityAction::BotError, details)),
            )
            .await
        {
            Ok(version) => {
                self.version = version;
                self.status = status;
            }
            Err(e) => error!("[Worker] Bot {} could not record error state: {}", self.bot_id, e),
        }
    }
}

async fn recv_tick(ticks: &mut Option<broadcast::Receiver<PriceTick>>) -> Result<PriceTick, RecvError> {
    match ticks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn order_details(order: &Order, resting: bool) -> serde_json::Value {
    json!({
        "order_id": order.id,
        "side": order.side,
        "role": order.role,
        "price": order.price,
        "quantity": order.quantity,
        "grid_level": order.grid_level,
        "safety_level": order.safety_level,
        "resting": resting,
    })
}
