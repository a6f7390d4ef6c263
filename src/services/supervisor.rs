//! Bot supervisor
//!
//! Owns the registry of live workers, fans price ticks out to them, routes
//! fills to the worker that owns the order and forwards operator commands.
//! A worker failure only ever affects its own bot.

use super::activity_log::ActivityAction;
use super::execution::OrderExecutor;
use super::metrics::{Metrics, MetricsSnapshot};
use super::worker::{BotCommand, BotEvent, BotWorker, CommandReply, WorkerContext};
use crate::config::SupervisorConfig;
use crate::db::{Database, NewBot};
use crate::error::{EngineError, EngineResult};
use crate::strategies::{Strategy, StrategyConfig};
use crate::types::{Bot, BotId, BotStatus, Fill, PriceTick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each worker to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Request to create and start a bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBotRequest {
    pub user_id: String,
    pub name: String,
    pub pair: String,
    pub activation_key: String,
    pub config: StrategyConfig,
    /// Price to build a grid ladder against. Falls back to the last tick seen
    /// for the pair; without either the ladder waits for the first tick.
    #[serde(default)]
    pub initial_price: Option<Decimal>,
}

struct WorkerHandle {
    events: mpsc::Sender<BotEvent>,
    /// Watcher around the worker task
    task: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: WorkerContext,
    price_tx: broadcast::Sender<PriceTick>,
    workers: RwLock<HashMap<BotId, WorkerHandle>>,
    last_prices: RwLock<HashMap<String, PriceTick>>,
}

impl Supervisor {
    pub fn new(db: Arc<Database>, executor: Arc<dyn OrderExecutor>, config: SupervisorConfig) -> Self {
        let (price_tx, _) = broadcast::channel(config.price_channel_capacity);
        info!("[Supervisor] Using {} executor", executor.name());
        Self {
            ctx: WorkerContext {
                db,
                executor,
                config,
                metrics: Metrics::new(),
            },
            price_tx,
            workers: RwLock::new(HashMap::new()),
            last_prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Shared counters, for adapters that report into the same metrics
    pub fn metrics_handle(&self) -> Metrics {
        self.ctx.metrics.clone()
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.ctx.db
    }

    // ==================== START ====================

    /// Validate, persist and launch a new bot. Nothing is written when the
    /// configuration is invalid.
    pub async fn start_bot(&self, request: StartBotRequest) -> EngineResult<Bot> {
        request.config.validate()?;
        if request.pair.trim().is_empty() {
            return Err(EngineError::InvalidConfig("pair is required".into()));
        }
        if request.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("name is required".into()));
        }

        let new_bot = NewBot {
            user_id: request.user_id.clone(),
            name: request.name.clone(),
            pair: request.pair.trim().to_uppercase(),
            activation_key: request.activation_key.trim().to_uppercase(),
        };
        let bot = self.ctx.db.create_bot(&new_bot, &request.config).await?;

        let strategy = match Strategy::new(bot.id, request.config) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.mark_error(bot.id, &e.to_string()).await;
                return Err(e);
            }
        };

        let price = match request.initial_price {
            Some(price) => Some(price),
            None => self.last_prices.read().await.get(&bot.pair).map(|t| t.price),
        };

        // Start-up submissions are held until the worker runs, so no fill can
        // arrive before it is registered
        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.queue_capacity);
        let mut worker = BotWorker::new(&bot, strategy, self.ctx.clone(), events_tx.clone());
        if let Err(e) = worker.start(price).await {
            worker.fail(e.to_string()).await;
        }
        let mut workers = self.workers.write().await;
        self.spawn_worker(&mut workers, worker, events_tx, events_rx);
        drop(workers);

        info!(
            "[Supervisor] Started {} bot {} '{}' on {} for {}",
            bot.bot_type, bot.id, bot.name, bot.pair, bot.user_id
        );
        self.ctx.db.get_bot(bot.id).await
    }

    fn spawn_worker(
        &self,
        workers: &mut HashMap<BotId, WorkerHandle>,
        worker: BotWorker,
        events_tx: mpsc::Sender<BotEvent>,
        events_rx: mpsc::Receiver<BotEvent>,
    ) {
        let bot_id = worker.bot_id();
        let ticks = self.price_tx.subscribe();
        let task = tokio::spawn(worker.run(events_rx, ticks));
        let watcher = watch_worker(bot_id, task, self.ctx.db.clone(), self.ctx.metrics.clone());

        workers.insert(
            bot_id,
            WorkerHandle {
                events: events_tx,
                task: watcher,
            },
        );
    }

    /// Sender for the bot's worker, restoring one from the database when the
    /// bot has none (error state after a restart or panic, or not yet
    /// recovered). `None` for stopped bots, which never get a worker again.
    async fn live_worker(&self, bot_id: BotId) -> EngineResult<Option<mpsc::Sender<BotEvent>>> {
        if let Some(handle) = self.workers.read().await.get(&bot_id) {
            if !handle.events.is_closed() {
                return Ok(Some(handle.events.clone()));
            }
        }

        let mut workers = self.workers.write().await;
        // Another caller may have restored it while we waited for the lock
        if let Some(handle) = workers.get(&bot_id) {
            if !handle.events.is_closed() {
                return Ok(Some(handle.events.clone()));
            }
            workers.remove(&bot_id);
        }

        let bot = self.ctx.db.get_bot(bot_id).await?;
        if !bot.status.is_active() {
            return Ok(None);
        }
        let events_tx = self.restore_worker(&mut workers, &bot).await?;
        Ok(Some(events_tx))
    }

    async fn worker_for(&self, bot_id: BotId, target: BotStatus) -> EngineResult<mpsc::Sender<BotEvent>> {
        self.live_worker(bot_id)
            .await?
            .ok_or(EngineError::InvalidTransition {
                bot_id,
                from: BotStatus::Stopped,
                to: target,
            })
    }

    async fn restore_worker(
        &self,
        workers: &mut HashMap<BotId, WorkerHandle>,
        bot: &Bot,
    ) -> EngineResult<mpsc::Sender<BotEvent>> {
        let strategy = self.ctx.db.load_strategy(bot).await?;
        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.queue_capacity);
        let worker = BotWorker::new(bot, strategy, self.ctx.clone(), events_tx.clone());
        self.spawn_worker(workers, worker, events_tx.clone(), events_rx);
        debug!("[Supervisor] Restored worker for bot {} ({})", bot.id, bot.status);
        Ok(events_tx)
    }

    // ==================== EVENTS ====================

    /// Publish a tick to every worker. Workers filter by pair and status.
    pub async fn on_price_tick(&self, tick: PriceTick) {
        self.ctx.metrics.inc_ticks_received();
        {
            let mut last = self.last_prices.write().await;
            let newer = last
                .get(&tick.pair)
                .map_or(true, |prev| tick.timestamp > prev.timestamp);
            if newer {
                last.insert(tick.pair.clone(), tick.clone());
            }
        }
        if self.price_tx.send(tick).is_err() {
            debug!("[Supervisor] No workers listening for prices");
        }
    }

    /// Route a fill to the worker owning the order. Bots without a worker
    /// get one restored so the fill is applied whatever their status.
    pub async fn on_fill(&self, fill: Fill) -> EngineResult<()> {
        let Some(bot_id) = self.ctx.db.order_owner(&fill.order_id).await? else {
            warn!("[Supervisor] Fill for unknown order {}", fill.order_id);
            return Err(EngineError::OrderNotFound(fill.order_id));
        };

        let Some(sender) = self.live_worker(bot_id).await? else {
            warn!("[Supervisor] Fill {} for stopped bot {}", fill.order_id, bot_id);
            return Err(EngineError::WorkerUnavailable(bot_id));
        };

        sender
            .send(BotEvent::Fill(fill))
            .await
            .map_err(|_| EngineError::WorkerUnavailable(bot_id))
    }

    /// Forward every fill from an executor's stream until it closes
    pub fn spawn_fill_router(self: &Arc<Self>, mut fills: mpsc::Receiver<Fill>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(fill) = fills.recv().await {
                let order_id = fill.order_id.clone();
                if let Err(e) = supervisor.on_fill(fill).await {
                    warn!("[Supervisor] Dropped fill for {}: {}", order_id, e);
                }
            }
            debug!("[Supervisor] Fill stream closed");
        })
    }

    // ==================== COMMANDS ====================

    async fn command<F>(&self, bot_id: BotId, target: BotStatus, build: F) -> EngineResult<Bot>
    where
        F: FnOnce(CommandReply) -> BotCommand,
    {
        let sender = self.worker_for(bot_id, target).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(BotEvent::Command(build(reply_tx)))
            .await
            .map_err(|_| EngineError::WorkerUnavailable(bot_id))?;
        reply_rx
            .await
            .map_err(|_| EngineError::WorkerUnavailable(bot_id))??;
        self.ctx.db.get_bot(bot_id).await
    }

    pub async fn pause_bot(&self, bot_id: BotId) -> EngineResult<Bot> {
        self.command(bot_id, BotStatus::Paused, BotCommand::Pause).await
    }

    pub async fn resume_bot(&self, bot_id: BotId) -> EngineResult<Bot> {
        self.command(bot_id, BotStatus::Running, BotCommand::Resume).await
    }

    /// Cancel open orders and stop for good
    pub async fn stop_bot(&self, bot_id: BotId) -> EngineResult<Bot> {
        let bot = self.command(bot_id, BotStatus::Stopped, BotCommand::Stop).await?;
        if let Some(handle) = self.workers.write().await.remove(&bot_id) {
            // The worker exits on its own after a stop
            drop(handle.task);
        }
        Ok(bot)
    }

    pub async fn status(&self, bot_id: BotId) -> EngineResult<Bot> {
        self.ctx.db.get_bot(bot_id).await
    }

    pub async fn list(&self) -> EngineResult<Vec<Bot>> {
        self.ctx.db.list_bots().await
    }

    /// Reload every running or paused bot after a restart. Bots in `error`
    /// get a worker on their next fill or operator command.
    pub async fn recover(&self) -> EngineResult<usize> {
        let bots = self
            .ctx
            .db
            .bots_with_status(&[BotStatus::Running, BotStatus::Paused])
            .await?;

        let mut workers = self.workers.write().await;
        let mut restored = 0;
        for bot in bots {
            if workers.contains_key(&bot.id) {
                continue;
            }
            match self.restore_worker(&mut workers, &bot).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    error!("[Supervisor] Could not restore bot {}: {}", bot.id, e);
                    self.mark_error(bot.id, &format!("recovery failed: {}", e)).await;
                }
            }
        }

        info!("[Supervisor] Recovered {} bot(s)", restored);
        Ok(restored)
    }

    /// Ask every worker to exit and wait for them. Status is left as is so
    /// `recover` picks the bots up again.
    pub async fn shutdown(&self) {
        let handles: Vec<(BotId, WorkerHandle)> = self.workers.write().await.drain().collect();
        info!("[Supervisor] Shutting down {} worker(s)", handles.len());

        for (bot_id, handle) in handles {
            if handle.events.send(BotEvent::Command(BotCommand::Shutdown)).await.is_err() {
                debug!("[Supervisor] Worker for bot {} already gone", bot_id);
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.task).await.is_err() {
                warn!("[Supervisor] Worker for bot {} did not exit in time", bot_id);
            }
        }
    }

    async fn mark_error(&self, bot_id: BotId, message: &str) {
        record_error(&self.ctx.db, &self.ctx.metrics, bot_id, message).await;
    }
}

/// Watch a worker task and move its bot to `error` if it panics
fn watch_worker(bot_id: BotId, task: JoinHandle<()>, db: Arc<Database>, metrics: Metrics) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Err(e) = task.await else { return };
        if !e.is_panic() {
            return;
        }
        error!("[Supervisor] Worker for bot {} panicked", bot_id);
        record_error(&db, &metrics, bot_id, "worker panicked").await;
    })
}

/// Unconditional `error` transition, used where no worker owns the bot
async fn record_error(db: &Database, metrics: &Metrics, bot_id: BotId, message: &str) {
    metrics.inc_bot_errors();
    let details = json!({ "error": message });
    if let Err(e) = db
        .update_status(
            bot_id,
            None,
            BotStatus::Error,
            Some(message),
            Some((ActivityAction::BotError, details)),
        )
        .await
    {
        error!("[Supervisor] Could not mark bot {} as failed: {}", bot_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::activation::ActivationService;
    use crate::services::execution::{OrderRequest, PaperExecutor};
    use crate::services::order_errors::ExecutionError;
    use crate::strategies::dca::DcaConfig;
    use crate::strategies::grid::GridConfig;
    use crate::types::{BotType, Frequency, GridStrategy, GridType, OrderRole, OrderStatus, Side};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use std::future::Future;

    /// Rejects everything on one pair, paper-trades the rest
    struct FlakyPairExecutor {
        bad_pair: String,
        paper: PaperExecutor,
    }

    #[async_trait]
    impl OrderExecutor for FlakyPairExecutor {
        async fn submit(&self, request: &OrderRequest) -> Result<String, ExecutionError> {
            if request.pair == self.bad_pair {
                return Err(ExecutionError::InsufficientFunds);
            }
            self.paper.submit(request).await
        }

        async fn cancel(&self, exchange_ref: &str) -> Result<(), ExecutionError> {
            self.paper.cancel(exchange_ref).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Accepts every order and never fills; tests deliver fills by hand
    struct HoldingExecutor;

    #[async_trait]
    impl OrderExecutor for HoldingExecutor {
        async fn submit(&self, request: &OrderRequest) -> Result<String, ExecutionError> {
            Ok(format!("held-{}", request.order_id))
        }

        async fn cancel(&self, _exchange_ref: &str) -> Result<(), ExecutionError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "holding"
        }
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            stale_feed_after: Duration::from_secs(3600),
            ..SupervisorConfig::default()
        }
    }

    async fn paper_supervisor(db: Arc<Database>) -> Arc<Supervisor> {
        paper_supervisor_with(db, test_config()).await
    }

    async fn paper_supervisor_with(db: Arc<Database>, config: SupervisorConfig) -> Arc<Supervisor> {
        let (executor, fills) = PaperExecutor::new(Decimal::ZERO, 64);
        let supervisor = Arc::new(Supervisor::new(db, Arc::new(executor), config));
        supervisor.spawn_fill_router(fills);
        supervisor
    }

    fn dca_config() -> StrategyConfig {
        StrategyConfig::Dca(DcaConfig {
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
        })
    }

    fn grid_config() -> StrategyConfig {
        StrategyConfig::Grid(GridConfig {
            upper_price: dec!(30000),
            lower_price: dec!(20000),
            grid_count: 10,
            grid_type: GridType::Arithmetic,
            total_investment: dec!(10000),
            strategy: GridStrategy::Neutral,
            stop_upper_price: None,
            stop_lower_price: None,
        })
    }

    async fn request(
        db: &Arc<Database>,
        user: &str,
        pair: &str,
        config: StrategyConfig,
        initial_price: Option<Decimal>,
    ) -> StartBotRequest {
        let keys = ActivationService::new(db.clone(), 5);
        let key = keys
            .generate(config.bot_type(), "admin", None, 1)
            .await
            .unwrap()
            .remove(0);
        keys.redeem(&key.key, user).await.unwrap();
        StartBotRequest {
            user_id: user.to_string(),
            name: format!("{} bot", pair),
            pair: pair.to_string(),
            activation_key: key.key,
            config,
            initial_price,
        }
    }

    fn tick(pair: &str, price: Decimal, at: DateTime<Utc>) -> PriceTick {
        PriceTick {
            pair: pair.to_string(),
            price,
            timestamp: at,
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_for_trades(db: &Arc<Database>, bot_id: BotId, trades: i64) {
        eventually(&format!("{} trades on bot {}", trades, bot_id), || {
            let db = db.clone();
            async move { db.get_bot(bot_id).await.unwrap().trade_count >= trades }
        })
        .await;
    }

    fn actions(entries: &[crate::types::ActivityLogEntry]) -> Vec<String> {
        entries.iter().map(|e| e.action.clone()).collect()
    }

    async fn stale_feed_entries(db: &Arc<Database>, bot_id: BotId) -> Vec<crate::types::ActivityLogEntry> {
        db.activity_for_bot(bot_id, 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "stale_feed")
            .collect()
    }

    async fn wait_for_status(db: &Arc<Database>, bot_id: BotId, status: BotStatus) {
        eventually(&format!("bot {} {}", bot_id, status), || {
            let db = db.clone();
            async move { db.get_bot(bot_id).await.unwrap().status == status }
        })
        .await;
    }

    #[tokio::test]
    async fn test_dca_deal_runs_to_take_profit() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "alice", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert_eq!(bot.bot_type, BotType::Dca);

        let t0 = Utc::now();
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), t0)).await;
        wait_for_trades(&db, bot.id, 1).await;

        let bot_after_buy = supervisor.status(bot.id).await.unwrap();
        assert_eq!(bot_after_buy.invested_amount, dec!(100));

        supervisor
            .on_price_tick(tick("BTC/USDT", dec!(110), t0 + chrono::Duration::milliseconds(10)))
            .await;
        wait_for_trades(&db, bot.id, 2).await;

        let done = supervisor.status(bot.id).await.unwrap();
        assert_eq!(done.total_pnl, dec!(10));
        let log = actions(&db.activity_for_bot(bot.id, 50).await.unwrap());
        assert!(log.contains(&"take_profit_triggered".to_string()));
        assert!(log.contains(&"deal_closed".to_string()));

        let metrics = supervisor.metrics();
        assert_eq!(metrics.orders_submitted, 2);
        assert_eq!(metrics.orders_filled, 2);
    }

    #[tokio::test]
    async fn test_grid_ladder_is_persisted_on_start() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "bob", "BTC/USDT", grid_config(), Some(dec!(25000))).await)
            .await
            .unwrap();

        let open = db.open_orders(bot.id).await.unwrap();
        assert_eq!(open.len(), 5);
        assert!(open.iter().all(|o| !o.submitted));
        let log = actions(&db.activity_for_bot(bot.id, 50).await.unwrap());
        assert!(log.contains(&"bot_started".to_string()));
        assert!(log.contains(&"ladder_built".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_config_persists_nothing() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let mut req = request(&db, "carol", "BTC/USDT", grid_config(), None).await;
        if let StrategyConfig::Grid(cfg) = &mut req.config {
            cfg.lower_price = dec!(31000);
        }

        let result = supervisor.start_bot(req).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        assert!(supervisor.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paused_bot_ignores_ticks() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "dave", "ETH/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let paused = supervisor.pause_bot(bot.id).await.unwrap();
        assert_eq!(paused.status, BotStatus::Paused);
        assert!(matches!(
            supervisor.pause_bot(bot.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));

        supervisor.on_price_tick(tick("ETH/USDT", dec!(2000), Utc::now())).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(db.orders_for_bot(bot.id).await.unwrap().is_empty());

        let resumed = supervisor.resume_bot(bot.id).await.unwrap();
        assert_eq!(resumed.status, BotStatus::Running);
        supervisor.on_price_tick(tick("ETH/USDT", dec!(2000), Utc::now())).await;
        wait_for_trades(&db, bot.id, 1).await;
    }

    #[tokio::test]
    async fn test_out_of_order_tick_is_dropped() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "erin", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let t0 = Utc::now();
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), t0)).await;
        wait_for_trades(&db, bot.id, 1).await;

        // Older than the last accepted tick; would otherwise take profit
        supervisor
            .on_price_tick(tick("BTC/USDT", dec!(150), t0 - chrono::Duration::seconds(1)))
            .await;
        let sup = supervisor.clone();
        eventually("dropped tick", move || {
            let sup = sup.clone();
            async move { sup.metrics().ticks_dropped >= 1 }
        })
        .await;
        assert_eq!(supervisor.status(bot.id).await.unwrap().trade_count, 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_open_orders() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "frank", "BTC/USDT", grid_config(), Some(dec!(25000))).await)
            .await
            .unwrap();

        let stopped = supervisor.stop_bot(bot.id).await.unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
        assert!(db.open_orders(bot.id).await.unwrap().is_empty());
        let orders = db.orders_for_bot(bot.id).await.unwrap();
        assert_eq!(orders.len(), 5);
        assert!(orders.iter().all(|o| o.status == OrderStatus::Cancelled));

        assert!(matches!(
            supervisor.resume_bot(bot.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            supervisor.stop_bot(bot.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejection_errors_only_that_bot() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (paper, fills) = PaperExecutor::new(Decimal::ZERO, 64);
        let executor = FlakyPairExecutor {
            bad_pair: "BAD/USDT".into(),
            paper,
        };
        let supervisor = Arc::new(Supervisor::new(db.clone(), Arc::new(executor), test_config()));
        supervisor.spawn_fill_router(fills);

        let bad = supervisor
            .start_bot(request(&db, "gina", "BAD/USDT", dca_config(), None).await)
            .await
            .unwrap();
        let good = supervisor
            .start_bot(request(&db, "gina", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let t0 = Utc::now();
        supervisor.on_price_tick(tick("BAD/USDT", dec!(100), t0)).await;
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), t0)).await;

        let db_check = db.clone();
        let bad_id = bad.id;
        eventually("bad bot in error", move || {
            let db = db_check.clone();
            async move { db.get_bot(bad_id).await.unwrap().status == BotStatus::Error }
        })
        .await;
        wait_for_trades(&db, good.id, 1).await;

        let failed = supervisor.status(bad.id).await.unwrap();
        assert!(failed.error_message.is_some());
        assert_eq!(supervisor.status(good.id).await.unwrap().status, BotStatus::Running);
        let entries = db.activity_for_bot(bad.id, 50).await.unwrap();
        let log = actions(&entries);
        assert!(log.contains(&"order_rejected".to_string()));
        assert!(log.contains(&"bot_error".to_string()));
        // Insufficient funds is permanent, so the port was called once
        let rejected = entries.iter().find(|e| e.action == "order_rejected").unwrap();
        assert_eq!(rejected.details["attempts"], 1);
        assert_eq!(supervisor.metrics().order_retries, 0);

        // An operator can still stop the failed bot
        let stopped = supervisor.stop_bot(bad.id).await.unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_fill_counts_once() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "hank", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), Utc::now())).await;
        wait_for_trades(&db, bot.id, 1).await;

        let filled = db.orders_for_bot(bot.id).await.unwrap().remove(0);
        supervisor
            .on_fill(Fill {
                order_id: filled.id.clone(),
                price: dec!(100),
                quantity: dec!(1),
                fee: Decimal::ZERO,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = supervisor.status(bot.id).await.unwrap();
        assert_eq!(after.trade_count, 1);
        assert_eq!(after.invested_amount, dec!(100));
    }

    #[tokio::test]
    async fn test_recover_restores_bots_after_restart() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let first = paper_supervisor(db.clone()).await;
        let bot = first
            .start_bot(request(&db, "ivy", "BTC/USDT", grid_config(), Some(dec!(25000))).await)
            .await
            .unwrap();
        first.shutdown().await;

        let second = paper_supervisor(db.clone()).await;
        assert_eq!(second.recover().await.unwrap(), 1);
        // Already registered, nothing more to restore
        assert_eq!(second.recover().await.unwrap(), 0);

        let stopped = second.stop_bot(bot.id).await.unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
        let orders = db.orders_for_bot(bot.id).await.unwrap();
        assert_eq!(orders.len(), 5);
        assert!(orders.iter().all(|o| o.status == OrderStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_fill_reaches_error_bot_after_restart() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let first = Arc::new(Supervisor::new(db.clone(), Arc::new(HoldingExecutor), test_config()));
        let bot = first
            .start_bot(request(&db, "jack", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        first.on_price_tick(tick("BTC/USDT", dec!(100), Utc::now())).await;
        let db_check = db.clone();
        let bot_id = bot.id;
        eventually("base order placed", move || {
            let db = db_check.clone();
            async move { db.open_orders(bot_id).await.unwrap().len() == 1 }
        })
        .await;
        let base = db.open_orders(bot.id).await.unwrap().remove(0);
        first.shutdown().await;
        db.update_status(bot.id, None, BotStatus::Error, Some("venue outage"), None)
            .await
            .unwrap();

        let second = Arc::new(Supervisor::new(db.clone(), Arc::new(HoldingExecutor), test_config()));
        assert_eq!(second.recover().await.unwrap(), 0);

        second
            .on_fill(Fill {
                order_id: base.id.clone(),
                price: dec!(100),
                quantity: dec!(1),
                fee: Decimal::ZERO,
            })
            .await
            .unwrap();
        wait_for_trades(&db, bot.id, 1).await;
        let filled = second.status(bot.id).await.unwrap();
        assert_eq!(filled.status, BotStatus::Error);
        assert_eq!(filled.invested_amount, dec!(100));

        let resumed = second.resume_bot(bot.id).await.unwrap();
        assert_eq!(resumed.status, BotStatus::Running);
        second.on_price_tick(tick("BTC/USDT", dec!(200), Utc::now())).await;
        let db_check = db.clone();
        eventually("take profit placed", move || {
            let db = db_check.clone();
            async move {
                db.open_orders(bot_id)
                    .await
                    .unwrap()
                    .iter()
                    .any(|o| o.role == OrderRole::DcaTakeProfit && o.side == Side::Sell)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_fill_for_stopped_bot_is_refused() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = Arc::new(Supervisor::new(db.clone(), Arc::new(HoldingExecutor), test_config()));
        let bot = supervisor
            .start_bot(request(&db, "kate", "BTC/USDT", grid_config(), Some(dec!(25000))).await)
            .await
            .unwrap();
        let order = db.open_orders(bot.id).await.unwrap().remove(0);
        supervisor.stop_bot(bot.id).await.unwrap();

        let result = supervisor
            .on_fill(Fill {
                order_id: order.id.clone(),
                price: order.price,
                quantity: order.quantity,
                fee: Decimal::ZERO,
            })
            .await;
        assert!(matches!(result, Err(EngineError::WorkerUnavailable(id)) if id == bot.id));
        assert_eq!(supervisor.status(bot.id).await.unwrap().trade_count, 0);
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_engine_unchanged() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let config = SupervisorConfig {
            snapshot_max_retries: 0,
            ..test_config()
        };
        let supervisor = paper_supervisor_with(db.clone(), config).await;
        let bot = supervisor
            .start_bot(request(&db, "liam", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        // Another writer moves the version; with no retries the tick's write fails
        db.update_status(bot.id, None, BotStatus::Running, None, None)
            .await
            .unwrap();
        let t0 = Utc::now();
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), t0)).await;
        wait_for_status(&db, bot.id, BotStatus::Error).await;
        assert!(db.orders_for_bot(bot.id).await.unwrap().is_empty());

        // The engine never saw its base order go out, so it places one now
        supervisor.resume_bot(bot.id).await.unwrap();
        supervisor
            .on_price_tick(tick("BTC/USDT", dec!(100), t0 + chrono::Duration::milliseconds(10)))
            .await;
        wait_for_trades(&db, bot.id, 1).await;
        assert_eq!(supervisor.status(bot.id).await.unwrap().invested_amount, dec!(100));
    }

    #[tokio::test]
    async fn test_snapshot_conflict_is_retried() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let bot = supervisor
            .start_bot(request(&db, "mia", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        db.update_status(bot.id, None, BotStatus::Running, None, None)
            .await
            .unwrap();
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), Utc::now())).await;
        wait_for_trades(&db, bot.id, 1).await;

        assert_eq!(supervisor.metrics().snapshot_conflicts, 1);
        let after = supervisor.status(bot.id).await.unwrap();
        assert_eq!(after.status, BotStatus::Running);
        assert_eq!(after.invested_amount, dec!(100));
    }

    #[tokio::test]
    async fn test_stale_ticks_are_dropped_and_logged_once() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let config = SupervisorConfig {
            max_tick_age: Some(Duration::from_secs(1)),
            ..test_config()
        };
        let supervisor = paper_supervisor_with(db.clone(), config).await;
        let bot = supervisor
            .start_bot(request(&db, "nora", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let now = Utc::now();
        supervisor
            .on_price_tick(tick("BTC/USDT", dec!(100), now - chrono::Duration::seconds(10)))
            .await;
        supervisor
            .on_price_tick(tick("BTC/USDT", dec!(100), now - chrono::Duration::seconds(9)))
            .await;
        let sup = supervisor.clone();
        eventually("stale ticks dropped", move || {
            let sup = sup.clone();
            async move { sup.metrics().ticks_dropped >= 2 }
        })
        .await;

        let stale = stale_feed_entries(&db, bot.id).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].details["reason"], "stale_tick");
        assert!(db.orders_for_bot(bot.id).await.unwrap().is_empty());

        // A fresh price trades normally
        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), Utc::now())).await;
        wait_for_trades(&db, bot.id, 1).await;
    }

    #[tokio::test]
    async fn test_silent_feed_is_reported_once() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let config = SupervisorConfig {
            stale_feed_after: Duration::from_millis(50),
            ..test_config()
        };
        let supervisor = paper_supervisor_with(db.clone(), config).await;
        let bot = supervisor
            .start_bot(request(&db, "omar", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let db_check = db.clone();
        let bot_id = bot.id;
        eventually("stale feed logged", move || {
            let db = db_check.clone();
            async move { !stale_feed_entries(&db, bot_id).await.is_empty() }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stale = stale_feed_entries(&db, bot.id).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].details["reason"], "no_ticks");
        let quiet = supervisor.status(bot.id).await.unwrap();
        assert_eq!(quiet.status, BotStatus::Running);
        assert!(db.orders_for_bot(bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_worker_only_fails_its_bot() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let broken = supervisor
            .start_bot(request(&db, "pia", "ETH/USDT", dca_config(), None).await)
            .await
            .unwrap();
        let healthy = supervisor
            .start_bot(request(&db, "pia", "BTC/USDT", dca_config(), None).await)
            .await
            .unwrap();

        let task = tokio::spawn(async { panic!("engine invariant broken") });
        watch_worker(broken.id, task, db.clone(), supervisor.metrics_handle())
            .await
            .unwrap();

        let failed = supervisor.status(broken.id).await.unwrap();
        assert_eq!(failed.status, BotStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("worker panicked"));
        assert!(actions(&db.activity_for_bot(broken.id, 50).await.unwrap()).contains(&"bot_error".to_string()));
        assert_eq!(supervisor.metrics().bot_errors, 1);

        supervisor.on_price_tick(tick("BTC/USDT", dec!(100), Utc::now())).await;
        wait_for_trades(&db, healthy.id, 1).await;
        assert_eq!(supervisor.status(healthy.id).await.unwrap().status, BotStatus::Running);
    }

    #[tokio::test]
    async fn test_start_persists_before_taking_registry_lock() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let supervisor = paper_supervisor(db.clone()).await;
        let req = request(&db, "quinn", "BTC/USDT", grid_config(), Some(dec!(25000))).await;

        let registry = supervisor.workers.read().await;
        let starter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start_bot(req).await })
        };

        // The ladder lands while the registry is still held elsewhere
        let db_check = db.clone();
        eventually("ladder persisted", move || {
            let db = db_check.clone();
            async move {
                match db.list_bots().await.unwrap().first() {
                    Some(bot) => db.open_orders(bot.id).await.unwrap().len() == 5,
                    None => false,
                }
            }
        })
        .await;
        assert!(!starter.is_finished());

        drop(registry);
        let bot = starter.await.unwrap().unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert!(supervisor.workers.read().await.contains_key(&bot.id));
    }
}
