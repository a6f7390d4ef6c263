//! Append-only activity log
//!
//! Every lifecycle transition and order event lands in `bot_activity_log`.
//! Entries are written once and never updated.

use crate::db::Database;
use crate::error::EngineResult;
use crate::types::{string_enum, ActivityLogEntry, BotId};
use std::sync::Arc;
use tracing::warn;

string_enum!(
    /// Kinds of activity log entries
    ActivityAction {
        KeyGenerated => "key_generated",
        KeyRedeemed => "key_redeemed",
        KeyRevoked => "key_revoked",
        BotStarted => "bot_started",
        LadderBuilt => "ladder_built",
        OrderPlaced => "order_placed",
        OrderFilled => "order_filled",
        OrderRejected => "order_rejected",
        OrderCancelled => "order_cancelled",
        SafetyOrderFilled => "safety_order_filled",
        TakeProfitTriggered => "take_profit_triggered",
        StopLossTriggered => "stop_loss_triggered",
        DealClosed => "deal_closed",
        GridLevelFilled => "grid_level_filled",
        BoundaryBreach => "boundary_breach",
        StaleFeed => "stale_feed",
        BotPaused => "bot_paused",
        BotResumed => "bot_resumed",
        BotStopped => "bot_stopped",
        BotError => "bot_error",
    }
);

/// Handle for writing and reading the activity log
#[derive(Clone)]
pub struct ActivityLog {
    db: Arc<Database>,
}

impl ActivityLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        bot_id: Option<BotId>,
        action: ActivityAction,
        details: serde_json::Value,
    ) -> EngineResult<i64> {
        self.db.append_activity(bot_id, action, &details).await
    }

    /// Record without failing the caller; a lost entry is only logged
    pub async fn record_best_effort(&self, bot_id: Option<BotId>, action: ActivityAction, details: serde_json::Value) {
        if let Err(e) = self.record(bot_id, action, details).await {
            warn!("[Activity] Failed to record {} for bot {:?}: {}", action, bot_id, e);
        }
    }

    /// Most recent entries for one bot, newest first
    pub async fn for_bot(&self, bot_id: BotId, limit: i64) -> EngineResult<Vec<ActivityLogEntry>> {
        self.db.activity_for_bot(bot_id, limit).await
    }

    /// Most recent entries across all bots, newest first
    pub async fn recent(&self, limit: i64) -> EngineResult<Vec<ActivityLogEntry>> {
        self.db.recent_activity(limit).await
    }
}
