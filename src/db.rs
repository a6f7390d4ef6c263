//! SQLite persistence for bots, strategy state, orders, activity and activation keys

use crate::error::{EngineError, EngineResult};
use crate::services::activity_log::ActivityAction;
use crate::strategies::{
    BotFigures, DcaConfig, DcaEngine, DcaState, DeferredOrder, GridConfig, GridEngine, GridLevel,
    GridState, Strategy, StrategyConfig,
};
use crate::types::{
    ActivationKey, ActivityLogEntry, Bot, BotId, BotStatus, BotType, KeyStatus, Order, OrderStatus, Side,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Order change written together with a bot snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum OrderUpdate {
    /// New order, resting or submitted
    Insert(Order),
    /// A resting order was handed to the execution port
    Submitted { order_id: String },
    Filled {
        order_id: String,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        filled_at: DateTime<Utc>,
    },
    /// Rejected by the port but kept resting in the local book
    Requeued { order_id: String, error: String },
    Cancelled { order_id: String, error: Option<String> },
}

/// Everything one worker event changes, persisted in one transaction
#[derive(Debug)]
pub struct Snapshot<'a> {
    pub bot_id: BotId,
    pub strategy: &'a Strategy,
    pub figures: BotFigures,
    /// Fills applied by this event
    pub new_trades: i64,
    pub orders: &'a [OrderUpdate],
    pub activity: &'a [(ActivityAction, serde_json::Value)],
    /// Status change and error message, if any
    pub status: Option<(BotStatus, Option<String>)>,
}

/// Fields of a bot that are not derived from its strategy
#[derive(Debug, Clone)]
pub struct NewBot {
    pub user_id: String,
    pub name: String,
    pub pair: String,
    pub activation_key: String,
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires
    /// keeps the schema alive for the life of the pool.
    pub async fn in_memory() -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activation_keys (
                key TEXT PRIMARY KEY,
                bot_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unused',
                created_by TEXT NOT NULL,
                notes TEXT,
                redeemed_by TEXT,
                redeemed_at TEXT,
                bot_id INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                bot_type TEXT NOT NULL,
                pair TEXT NOT NULL,
                status TEXT NOT NULL,
                invested_amount TEXT NOT NULL DEFAULT '0',
                current_value TEXT NOT NULL DEFAULT '0',
                total_pnl TEXT NOT NULL DEFAULT '0',
                trade_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                activation_key TEXT UNIQUE REFERENCES activation_keys(key),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dca_bot_config (
                bot_id INTEGER PRIMARY KEY REFERENCES trading_bots(id),
                order_amount TEXT NOT NULL,
                frequency TEXT NOT NULL,
                take_profit_pct TEXT NOT NULL,
                stop_loss_pct TEXT,
                trailing_tp_enabled INTEGER NOT NULL DEFAULT 0,
                trailing_tp_deviation TEXT NOT NULL DEFAULT '0',
                safety_orders_enabled INTEGER NOT NULL DEFAULT 0,
                max_safety_orders INTEGER NOT NULL DEFAULT 0,
                safety_order_size TEXT NOT NULL DEFAULT '0',
                safety_order_step_pct TEXT NOT NULL DEFAULT '0',
                safety_order_step_scale TEXT NOT NULL DEFAULT '1',
                safety_order_volume_scale TEXT NOT NULL DEFAULT '1',
                current_avg_price TEXT NOT NULL DEFAULT '0',
                total_base_bought TEXT NOT NULL DEFAULT '0',
                total_quote_spent TEXT NOT NULL DEFAULT '0',
                active_safety_count INTEGER NOT NULL DEFAULT 0,
                peak_profit_pct TEXT NOT NULL DEFAULT '0',
                deal_count INTEGER NOT NULL DEFAULT 0,
                last_buy_at TEXT,
                trailing_armed INTEGER NOT NULL DEFAULT 0,
                realized_pnl TEXT NOT NULL DEFAULT '0'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS grid_bot_config (
                bot_id INTEGER PRIMARY KEY REFERENCES trading_bots(id),
                upper_price TEXT NOT NULL,
                lower_price TEXT NOT NULL,
                grid_count INTEGER NOT NULL,
                grid_type TEXT NOT NULL,
                total_investment TEXT NOT NULL,
                per_grid_amount TEXT NOT NULL,
                strategy TEXT NOT NULL,
                stop_upper_price TEXT,
                stop_lower_price TEXT,
                grid_profit TEXT NOT NULL DEFAULT '0',
                float_pnl TEXT NOT NULL DEFAULT '0',
                total_base_held TEXT NOT NULL DEFAULT '0',
                avg_buy_price TEXT NOT NULL DEFAULT '0',
                completed_cycles INTEGER NOT NULL DEFAULT 0,
                boundary_breached INTEGER NOT NULL DEFAULT 0,
                ladder_built INTEGER NOT NULL DEFAULT 0,
                last_price TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS grid_levels (
                bot_id INTEGER NOT NULL REFERENCES trading_bots(id),
                level_index INTEGER NOT NULL,
                price TEXT NOT NULL,
                buy_filled INTEGER NOT NULL DEFAULT 0,
                sell_filled INTEGER NOT NULL DEFAULT 0,
                buy_order_id TEXT,
                sell_order_id TEXT,
                deferred_side TEXT,
                deferred_quantity TEXT,
                PRIMARY KEY (bot_id, level_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_orders (
                id TEXT PRIMARY KEY,
                bot_id INTEGER NOT NULL REFERENCES trading_bots(id),
                side TEXT NOT NULL,
                role TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                total TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL DEFAULT 'pending',
                grid_level INTEGER,
                safety_level INTEGER,
                submitted INTEGER NOT NULL DEFAULT 0,
                exchange_ref TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                filled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes for fast lookups
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bots_status ON trading_bots(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_bot_status ON bot_orders(bot_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_activity_bot ON bot_activity_log(bot_id)")
            .execute(&self.pool)
            .await?;

        debug!("Database initialized");
        Ok(())
    }

    // ==================== BOTS ====================

    /// Persist a new running bot and its strategy config, consuming the
    /// caller's redeemed activation key.
    pub async fn create_bot(&self, new: &NewBot, config: &StrategyConfig) -> EngineResult<Bot> {
        let bot_type = config.bot_type();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let key_row = sqlx::query(
            "SELECT bot_type, status, redeemed_by, bot_id FROM activation_keys WHERE key = ?",
        )
        .bind(&new.activation_key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(EngineError::KeyNotFound)?;

        let key_type: BotType = enum_col(&key_row, "bot_type")?;
        let key_status: KeyStatus = enum_col(&key_row, "status")?;
        let redeemed_by: Option<String> = key_row.try_get("redeemed_by")?;
        let bound_bot: Option<BotId> = key_row.try_get("bot_id")?;

        if key_status != KeyStatus::Active {
            return Err(EngineError::KeyNotUsable(format!("key is {}", key_status)));
        }
        if redeemed_by.as_deref() != Some(new.user_id.as_str()) {
            return Err(EngineError::KeyNotUsable("key was redeemed by another user".into()));
        }
        if bound_bot.is_some() {
            return Err(EngineError::KeyAlreadyUsed);
        }
        if key_type != bot_type {
            return Err(EngineError::KeyNotUsable(format!(
                "key is for {} bots, not {}",
                key_type, bot_type
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO trading_bots (user_id, name, bot_type, pair, status, activation_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.user_id)
        .bind(&new.name)
        .bind(bot_type.as_str())
        .bind(&new.pair)
        .bind(BotStatus::Running.as_str())
        .bind(&new.activation_key)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let bot_id = result.last_insert_rowid();

        match config {
            StrategyConfig::Dca(dca) => insert_dca_config(&mut tx, bot_id, dca).await?,
            StrategyConfig::Grid(grid) => insert_grid_config(&mut tx, bot_id, grid).await?,
        }

        let bound = sqlx::query("UPDATE activation_keys SET bot_id = ? WHERE key = ? AND bot_id IS NULL")
            .bind(bot_id)
            .bind(&new.activation_key)
            .execute(&mut *tx)
            .await?;
        if bound.rows_affected() == 0 {
            return Err(EngineError::KeyAlreadyUsed);
        }

        let details = serde_json::json!({
            "name": new.name,
            "pair": new.pair,
            "bot_type": bot_type,
            "from": BotStatus::Stopped,
            "to": BotStatus::Running,
        });
        insert_activity(&mut tx, Some(bot_id), ActivityAction::BotStarted, &details).await?;

        tx.commit().await?;

        info!("Created {} bot {} '{}' on {}", bot_type, bot_id, new.name, new.pair);
        self.get_bot(bot_id).await
    }

    pub async fn get_bot(&self, bot_id: BotId) -> EngineResult<Bot> {
        let row = sqlx::query("SELECT * FROM trading_bots WHERE id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::BotNotFound(bot_id))?;
        row_to_bot(&row)
    }

    pub async fn list_bots(&self) -> EngineResult<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM trading_bots ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_bot).collect()
    }

    pub async fn bots_with_status(&self, statuses: &[BotStatus]) -> EngineResult<Vec<Bot>> {
        let bots = self.list_bots().await?;
        Ok(bots.into_iter().filter(|b| statuses.contains(&b.status)).collect())
    }

    /// Change status outside a worker. `expected_version` of `None` writes
    /// unconditionally. Returns the new version.
    pub async fn update_status(
        &self,
        bot_id: BotId,
        expected_version: Option<i64>,
        status: BotStatus,
        error_message: Option<&str>,
        activity: Option<(ActivityAction, serde_json::Value)>,
    ) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE trading_bots
            SET status = ?, error_message = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND (? IS NULL OR version = ?)
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(bot_id)
        .bind(expected_version)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match expected_version {
                Some(_) => EngineError::VersionConflict(bot_id),
                None => EngineError::BotNotFound(bot_id),
            });
        }

        if let Some((action, details)) = activity {
            insert_activity(&mut tx, Some(bot_id), action, &details).await?;
        }

        let (version,): (i64,) = sqlx::query_as("SELECT version FROM trading_bots WHERE id = ?")
            .bind(bot_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(version)
    }

    /// Write one worker event's effects. Fails with `VersionConflict` when
    /// another writer moved the bot past `expected_version`; nothing is
    /// written in that case.
    pub async fn save_snapshot(&self, snapshot: &Snapshot<'_>, expected_version: i64) -> EngineResult<i64> {
        let bot_id = snapshot.bot_id;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let figures = &snapshot.figures;
        let result = match &snapshot.status {
            Some((status, error_message)) => {
                sqlx::query(
                    r#"
                    UPDATE trading_bots
                    SET invested_amount = ?, current_value = ?, total_pnl = ?,
                        trade_count = trade_count + ?, status = ?, error_message = ?,
                        version = version + 1, updated_at = ?
                    WHERE id = ? AND version = ?
                    "#,
                )
                .bind(figures.invested_amount.to_string())
                .bind(figures.current_value.to_string())
                .bind(figures.total_pnl.to_string())
                .bind(snapshot.new_trades)
                .bind(status.as_str())
                .bind(error_message.as_deref())
                .bind(now.to_rfc3339())
                .bind(bot_id)
                .bind(expected_version)
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE trading_bots
                    SET invested_amount = ?, current_value = ?, total_pnl = ?,
                        trade_count = trade_count + ?, version = version + 1, updated_at = ?
                    WHERE id = ? AND version = ?
                    "#,
                )
                .bind(figures.invested_amount.to_string())
                .bind(figures.current_value.to_string())
                .bind(figures.total_pnl.to_string())
                .bind(snapshot.new_trades)
                .bind(now.to_rfc3339())
                .bind(bot_id)
                .bind(expected_version)
                .execute(&mut *tx)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(EngineError::VersionConflict(bot_id));
        }

        for update in snapshot.orders {
            apply_order_update(&mut tx, bot_id, update).await?;
        }

        match snapshot.strategy {
            Strategy::Dca(engine) => save_dca_state(&mut tx, bot_id, engine.state()).await?,
            Strategy::Grid(engine) => {
                save_grid_state(&mut tx, bot_id, engine.state()).await?;
                for level in engine.levels() {
                    save_grid_level(&mut tx, bot_id, level).await?;
                }
            }
        }

        for (action, details) in snapshot.activity {
            insert_activity(&mut tx, Some(bot_id), *action, details).await?;
        }

        tx.commit().await?;
        Ok(expected_version + 1)
    }

    /// Rebuild a bot's engine from its config, runtime state and open orders
    pub async fn load_strategy(&self, bot: &Bot) -> EngineResult<Strategy> {
        let orders = self.open_orders(bot.id).await?;

        match bot.bot_type {
            BotType::Dca => {
                let row = sqlx::query("SELECT * FROM dca_bot_config WHERE bot_id = ?")
                    .bind(bot.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or_else(|| EngineError::Strategy(format!("bot {} has no dca config", bot.id)))?;
                let (config, state) = row_to_dca(&row)?;
                if orders.len() > 1 {
                    return Err(EngineError::Strategy(format!(
                        "dca bot {} has {} open orders",
                        bot.id,
                        orders.len()
                    )));
                }
                let in_flight = orders.into_iter().next();
                Ok(Strategy::Dca(DcaEngine::restore(bot.id, config, state, in_flight)))
            }
            BotType::Grid => {
                let row = sqlx::query("SELECT * FROM grid_bot_config WHERE bot_id = ?")
                    .bind(bot.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or_else(|| EngineError::Strategy(format!("bot {} has no grid config", bot.id)))?;
                let (config, state) = row_to_grid(&row)?;

                let level_rows = sqlx::query("SELECT * FROM grid_levels WHERE bot_id = ? ORDER BY level_index")
                    .bind(bot.id)
                    .fetch_all(&self.pool)
                    .await?;
                let levels = level_rows.iter().map(row_to_level).collect::<EngineResult<Vec<_>>>()?;

                Ok(Strategy::Grid(GridEngine::restore(bot.id, config, state, levels, orders)?))
            }
        }
    }

    // ==================== ORDERS ====================

    pub async fn open_orders(&self, bot_id: BotId) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM bot_orders WHERE bot_id = ? AND status = 'pending' ORDER BY created_at")
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn orders_for_bot(&self, bot_id: BotId) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM bot_orders WHERE bot_id = ? ORDER BY created_at")
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }

    /// Bot that owns an order, if the order exists
    pub async fn order_owner(&self, order_id: &str) -> EngineResult<Option<BotId>> {
        let row: Option<(BotId,)> = sqlx::query_as("SELECT bot_id FROM bot_orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Record the port's reference for a submitted order
    pub async fn set_exchange_ref(&self, order_id: &str, exchange_ref: &str) -> EngineResult<()> {
        sqlx::query("UPDATE bot_orders SET exchange_ref = ? WHERE id = ?")
            .bind(exchange_ref)
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== ACTIVITY LOG ====================

    pub async fn append_activity(
        &self,
        bot_id: Option<BotId>,
        action: ActivityAction,
        details: &serde_json::Value,
    ) -> EngineResult<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_activity(&mut conn, bot_id, action, details).await
    }

    pub async fn activity_for_bot(&self, bot_id: BotId, limit: i64) -> EngineResult<Vec<ActivityLogEntry>> {
        let rows = sqlx::query("SELECT * FROM bot_activity_log WHERE bot_id = ? ORDER BY id DESC LIMIT ?")
            .bind(bot_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_activity).collect()
    }

    pub async fn recent_activity(&self, limit: i64) -> EngineResult<Vec<ActivityLogEntry>> {
        let rows = sqlx::query("SELECT * FROM bot_activity_log ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_activity).collect()
    }

    // ==================== ACTIVATION KEYS ====================

    pub async fn insert_activation_key(&self, key: &ActivationKey) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activation_keys (key, bot_type, status, created_by, notes, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.key)
        .bind(key.bot_type.as_str())
        .bind(key.status.as_str())
        .bind(&key.created_by)
        .bind(&key.notes)
        .bind(key.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_activation_key(&self, key: &str) -> EngineResult<Option<ActivationKey>> {
        let row = sqlx::query("SELECT * FROM activation_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_key).transpose()
    }

    /// Atomic `unused -> active` transition. Exactly one concurrent caller
    /// succeeds; the rest see `KeyAlreadyUsed`.
    pub async fn redeem_activation_key(&self, key: &str, user_id: &str) -> EngineResult<ActivationKey> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE activation_keys
            SET status = 'active', redeemed_by = ?, redeemed_at = ?
            WHERE key = ? AND status = 'unused'
            "#,
        )
        .bind(user_id)
        .bind(now.to_rfc3339())
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM activation_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EngineError::KeyNotFound)?;
        let redeemed = row_to_key(&row)?;

        if result.rows_affected() == 0 {
            return Err(match redeemed.status {
                KeyStatus::Revoked => EngineError::KeyNotUsable("key has been revoked".into()),
                _ => EngineError::KeyAlreadyUsed,
            });
        }

        let details = serde_json::json!({
            "key": redeemed.key,
            "user_id": user_id,
            "bot_type": redeemed.bot_type,
        });
        insert_activity(&mut tx, None, ActivityAction::KeyRedeemed, &details).await?;
        tx.commit().await?;

        Ok(redeemed)
    }

    /// Revoke a key that has not been redeemed yet
    pub async fn revoke_activation_key(&self, key: &str) -> EngineResult<()> {
        let result = sqlx::query("UPDATE activation_keys SET status = 'revoked' WHERE key = ? AND status = 'unused'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.get_activation_key(key).await? {
                None => Err(EngineError::KeyNotFound),
                Some(_) => Err(EngineError::KeyAlreadyUsed),
            };
        }
        Ok(())
    }
}

// ==================== WRITE HELPERS ====================

async fn insert_activity(
    conn: &mut SqliteConnection,
    bot_id: Option<BotId>,
    action: ActivityAction,
    details: &serde_json::Value,
) -> EngineResult<i64> {
    let result = sqlx::query("INSERT INTO bot_activity_log (bot_id, action, details, created_at) VALUES (?, ?, ?, ?)")
        .bind(bot_id)
        .bind(action.as_str())
        .bind(serde_json::to_string(details)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_dca_config(conn: &mut SqliteConnection, bot_id: BotId, config: &DcaConfig) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dca_bot_config (
            bot_id, order_amount, frequency, take_profit_pct, stop_loss_pct,
            trailing_tp_enabled, trailing_tp_deviation, safety_orders_enabled, max_safety_orders,
            safety_order_size, safety_order_step_pct, safety_order_step_scale, safety_order_volume_scale
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(bot_id)
    .bind(config.order_amount.to_string())
    .bind(config.frequency.as_str())
    .bind(config.take_profit_pct.to_string())
    .bind(config.stop_loss_pct.map(|d| d.to_string()))
    .bind(config.trailing_tp_enabled)
    .bind(config.trailing_tp_deviation.to_string())
    .bind(config.safety_orders_enabled)
    .bind(config.max_safety_orders)
    .bind(config.safety_order_size.to_string())
    .bind(config.safety_order_step_pct.to_string())
    .bind(config.safety_order_step_scale.to_string())
    .bind(config.safety_order_volume_scale.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_grid_config(conn: &mut SqliteConnection, bot_id: BotId, config: &GridConfig) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO grid_bot_config (
            bot_id, upper_price, lower_price, grid_count, grid_type, total_investment,
            per_grid_amount, strategy, stop_upper_price, stop_lower_price
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(bot_id)
    .bind(config.upper_price.to_string())
    .bind(config.lower_price.to_string())
    .bind(config.grid_count)
    .bind(config.grid_type.as_str())
    .bind(config.total_investment.to_string())
    .bind(config.per_grid_amount().to_string())
    .bind(config.strategy.as_str())
    .bind(config.stop_upper_price.map(|d| d.to_string()))
    .bind(config.stop_lower_price.map(|d| d.to_string()))
    .execute(&mut *conn)
    .await?;

    for (index, price) in config.level_prices()?.into_iter().enumerate() {
        sqlx::query("INSERT INTO grid_levels (bot_id, level_index, price) VALUES (?, ?, ?)")
            .bind(bot_id)
            .bind(index as u32)
            .bind(price.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn apply_order_update(conn: &mut SqliteConnection, bot_id: BotId, update: &OrderUpdate) -> EngineResult<()> {
    match update {
        OrderUpdate::Insert(order) => {
            sqlx::query(
                r#"
                INSERT INTO bot_orders (
                    id, bot_id, side, role, quantity, price, total, fee, status,
                    grid_level, safety_level, submitted, exchange_ref, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&order.id)
            .bind(bot_id)
            .bind(order.side.as_str())
            .bind(order.role.as_str())
            .bind(order.quantity.to_string())
            .bind(order.price.to_string())
            .bind(order.total.to_string())
            .bind(order.fee.to_string())
            .bind(order.status.as_str())
            .bind(order.grid_level)
            .bind(order.safety_level)
            .bind(order.submitted)
            .bind(&order.exchange_ref)
            .bind(order.created_at.to_rfc3339())
            .execute(&mut *conn)
            .await?;
        }
        OrderUpdate::Submitted { order_id } => {
            sqlx::query("UPDATE bot_orders SET submitted = 1, error = NULL WHERE id = ? AND status = 'pending'")
                .bind(order_id)
                .execute(&mut *conn)
                .await?;
        }
        OrderUpdate::Filled {
            order_id,
            price,
            quantity,
            fee,
            filled_at,
        } => {
            // Conditional transition doubles as the persistent dedupe guard
            let result = sqlx::query(
                r#"
                UPDATE bot_orders
                SET status = 'filled', price = ?, quantity = ?, total = ?, fee = ?, filled_at = ?
                WHERE id = ? AND bot_id = ? AND status = 'pending'
                "#,
            )
            .bind(price.to_string())
            .bind(quantity.to_string())
            .bind((*price * *quantity).to_string())
            .bind(fee.to_string())
            .bind(filled_at.to_rfc3339())
            .bind(order_id)
            .bind(bot_id)
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 0 {
                return Err(EngineError::OrderNotFound(order_id.clone()));
            }
        }
        OrderUpdate::Requeued { order_id, error } => {
            sqlx::query("UPDATE bot_orders SET submitted = 0, error = ? WHERE id = ? AND status = 'pending'")
                .bind(error)
                .bind(order_id)
                .execute(&mut *conn)
                .await?;
        }
        OrderUpdate::Cancelled { order_id, error } => {
            sqlx::query("UPDATE bot_orders SET status = 'cancelled', error = ? WHERE id = ? AND status = 'pending'")
                .bind(error.as_deref())
                .bind(order_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn save_dca_state(conn: &mut SqliteConnection, bot_id: BotId, state: &DcaState) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE dca_bot_config
        SET current_avg_price = ?, total_base_bought = ?, total_quote_spent = ?,
            active_safety_count = ?, peak_profit_pct = ?, deal_count = ?, last_buy_at = ?,
            trailing_armed = ?, realized_pnl = ?
        WHERE bot_id = ?
        "#,
    )
    .bind(state.current_avg_price.to_string())
    .bind(state.total_base_bought.to_string())
    .bind(state.total_quote_spent.to_string())
    .bind(state.active_safety_count)
    .bind(state.peak_profit_pct.to_string())
    .bind(state.deal_count)
    .bind(state.last_buy_at.map(|t| t.to_rfc3339()))
    .bind(state.trailing_armed)
    .bind(state.realized_pnl.to_string())
    .bind(bot_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_grid_state(conn: &mut SqliteConnection, bot_id: BotId, state: &GridState) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE grid_bot_config
        SET grid_profit = ?, float_pnl = ?, total_base_held = ?, avg_buy_price = ?,
            completed_cycles = ?, boundary_breached = ?, ladder_built = ?, last_price = ?
        WHERE bot_id = ?
        "#,
    )
    .bind(state.grid_profit.to_string())
    .bind(state.float_pnl.to_string())
    .bind(state.total_base_held.to_string())
    .bind(state.avg_buy_price.to_string())
    .bind(state.completed_cycles)
    .bind(state.boundary_breached)
    .bind(state.ladder_built)
    .bind(state.last_price.map(|d| d.to_string()))
    .bind(bot_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_grid_level(conn: &mut SqliteConnection, bot_id: BotId, level: &GridLevel) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE grid_levels
        SET buy_filled = ?, sell_filled = ?, buy_order_id = ?, sell_order_id = ?,
            deferred_side = ?, deferred_quantity = ?
        WHERE bot_id = ? AND level_index = ?
        "#,
    )
    .bind(level.buy_filled)
    .bind(level.sell_filled)
    .bind(&level.buy_order_id)
    .bind(&level.sell_order_id)
    .bind(level.deferred.as_ref().map(|d| d.side.as_str()))
    .bind(level.deferred.as_ref().map(|d| d.quantity.to_string()))
    .bind(bot_id)
    .bind(level.level_index)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ==================== ROW PARSING ====================

fn dec_col(row: &SqliteRow, col: &str) -> EngineResult<Decimal> {
    let s: String = row.try_get(col)?;
    Ok(Decimal::from_str(&s)?)
}

fn opt_dec_col(row: &SqliteRow, col: &str) -> EngineResult<Option<Decimal>> {
    let s: Option<String> = row.try_get(col)?;
    Ok(s.map(|s| Decimal::from_str(&s)).transpose()?)
}

fn parse_time(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::Parse(format!("bad timestamp '{}': {}", s, e)))
}

fn time_col(row: &SqliteRow, col: &str) -> EngineResult<DateTime<Utc>> {
    let s: String = row.try_get(col)?;
    parse_time(&s)
}

fn opt_time_col(row: &SqliteRow, col: &str) -> EngineResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.try_get(col)?;
    s.as_deref().map(parse_time).transpose()
}

fn enum_col<T: FromStr<Err = EngineError>>(row: &SqliteRow, col: &str) -> EngineResult<T> {
    let s: String = row.try_get(col)?;
    s.parse()
}

fn row_to_bot(row: &SqliteRow) -> EngineResult<Bot> {
    Ok(Bot {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        bot_type: enum_col(row, "bot_type")?,
        pair: row.try_get("pair")?,
        status: enum_col(row, "status")?,
        invested_amount: dec_col(row, "invested_amount")?,
        current_value: dec_col(row, "current_value")?,
        total_pnl: dec_col(row, "total_pnl")?,
        trade_count: row.try_get("trade_count")?,
        error_message: row.try_get("error_message")?,
        version: row.try_get("version")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
    })
}

fn row_to_order(row: &SqliteRow) -> EngineResult<Order> {
    let status: OrderStatus = enum_col(row, "status")?;
    Ok(Order {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        side: enum_col(row, "side")?,
        role: enum_col(row, "role")?,
        quantity: dec_col(row, "quantity")?,
        price: dec_col(row, "price")?,
        total: dec_col(row, "total")?,
        fee: dec_col(row, "fee")?,
        status,
        grid_level: row.try_get("grid_level")?,
        safety_level: row.try_get("safety_level")?,
        submitted: row.try_get("submitted")?,
        exchange_ref: row.try_get("exchange_ref")?,
        created_at: time_col(row, "created_at")?,
        filled_at: opt_time_col(row, "filled_at")?,
    })
}

fn row_to_dca(row: &SqliteRow) -> EngineResult<(DcaConfig, DcaState)> {
    let config = DcaConfig {
        order_amount: dec_col(row, "order_amount")?,
        frequency: enum_col(row, "frequency")?,
        take_profit_pct: dec_col(row, "take_profit_pct")?,
        stop_loss_pct: opt_dec_col(row, "stop_loss_pct")?,
        trailing_tp_enabled: row.try_get("trailing_tp_enabled")?,
        trailing_tp_deviation: dec_col(row, "trailing_tp_deviation")?,
        safety_orders_enabled: row.try_get("safety_orders_enabled")?,
        max_safety_orders: row.try_get("max_safety_orders")?,
        safety_order_size: dec_col(row, "safety_order_size")?,
        safety_order_step_pct: dec_col(row, "safety_order_step_pct")?,
        safety_order_step_scale: dec_col(row, "safety_order_step_scale")?,
        safety_order_volume_scale: dec_col(row, "safety_order_volume_scale")?,
    };
    let state = DcaState {
        current_avg_price: dec_col(row, "current_avg_price")?,
        total_base_bought: dec_col(row, "total_base_bought")?,
        total_quote_spent: dec_col(row, "total_quote_spent")?,
        active_safety_count: row.try_get("active_safety_count")?,
        peak_profit_pct: dec_col(row, "peak_profit_pct")?,
        deal_count: row.try_get("deal_count")?,
        last_buy_at: opt_time_col(row, "last_buy_at")?,
        trailing_armed: row.try_get("trailing_armed")?,
        realized_pnl: dec_col(row, "realized_pnl")?,
    };
    Ok((config, state))
}

fn row_to_grid(row: &SqliteRow) -> EngineResult<(GridConfig, GridState)> {
    let config = GridConfig {
        upper_price: dec_col(row, "upper_price")?,
        lower_price: dec_col(row, "lower_price")?,
        grid_count: row.try_get("grid_count")?,
        grid_type: enum_col(row, "grid_type")?,
        total_investment: dec_col(row, "total_investment")?,
        strategy: enum_col(row, "strategy")?,
        stop_upper_price: opt_dec_col(row, "stop_upper_price")?,
        stop_lower_price: opt_dec_col(row, "stop_lower_price")?,
    };
    let state = GridState {
        grid_profit: dec_col(row, "grid_profit")?,
        float_pnl: dec_col(row, "float_pnl")?,
        total_base_held: dec_col(row, "total_base_held")?,
        avg_buy_price: dec_col(row, "avg_buy_price")?,
        completed_cycles: row.try_get("completed_cycles")?,
        boundary_breached: row.try_get("boundary_breached")?,
        ladder_built: row.try_get("ladder_built")?,
        last_price: opt_dec_col(row, "last_price")?,
    };
    Ok((config, state))
}

fn row_to_level(row: &SqliteRow) -> EngineResult<GridLevel> {
    let deferred_side: Option<String> = row.try_get("deferred_side")?;
    let deferred = match (deferred_side, opt_dec_col(row, "deferred_quantity")?) {
        (Some(side), Some(quantity)) => Some(DeferredOrder {
            side: side.parse::<Side>()?,
            quantity,
        }),
        _ => None,
    };
    Ok(GridLevel {
        level_index: row.try_get("level_index")?,
        price: dec_col(row, "price")?,
        buy_filled: row.try_get("buy_filled")?,
        sell_filled: row.try_get("sell_filled")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        deferred,
    })
}

fn row_to_activity(row: &SqliteRow) -> EngineResult<ActivityLogEntry> {
    let details: String = row.try_get("details")?;
    Ok(ActivityLogEntry {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        action: row.try_get("action")?,
        details: serde_json::from_str(&details)?,
        created_at: time_col(row, "created_at")?,
    })
}

fn row_to_key(row: &SqliteRow) -> EngineResult<ActivationKey> {
    Ok(ActivationKey {
        key: row.try_get("key")?,
        bot_type: enum_col(row, "bot_type")?,
        status: enum_col(row, "status")?,
        created_by: row.try_get("created_by")?,
        notes: row.try_get("notes")?,
        redeemed_by: row.try_get("redeemed_by")?,
        redeemed_at: opt_time_col(row, "redeemed_at")?,
        bot_id: row.try_get("bot_id")?,
        created_at: time_col(row, "created_at")?,
    })
}
