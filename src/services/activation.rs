//! Activation key issuance and redemption
//!
//! Keys gate access to a bot type. Redemption is an atomic
//! `unused -> active` transition; starting a bot then consumes the key.

use super::activity_log::{ActivityAction, ActivityLog};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::types::{ActivationKey, BotType, KeyStatus};
use chrono::Utc;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Random bytes per key
const KEY_BYTES: usize = 10;

/// Issues and redeems activation keys
#[derive(Clone)]
pub struct ActivationService {
    db: Arc<Database>,
    activity: ActivityLog,
    max_attempts: u32,
}

impl ActivationService {
    pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
        Self {
            activity: ActivityLog::new(db.clone()),
            db,
            max_attempts,
        }
    }

    /// Issue `count` fresh keys for `bot_type`
    pub async fn generate(
        &self,
        bot_type: BotType,
        admin_id: &str,
        notes: Option<&str>,
        count: u32,
    ) -> EngineResult<Vec<ActivationKey>> {
        self.generate_with(bot_type, admin_id, notes, count, || random_key(bot_type))
            .await
    }

    async fn generate_with<F>(
        &self,
        bot_type: BotType,
        admin_id: &str,
        notes: Option<&str>,
        count: u32,
        mut next_key: F,
    ) -> EngineResult<Vec<ActivationKey>>
    where
        F: FnMut() -> String,
    {
        if count == 0 {
            return Err(EngineError::InvalidConfig("key count must be at least 1".into()));
        }

        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut attempt = 0;
            let key = loop {
                attempt += 1;
                let key = ActivationKey {
                    key: next_key(),
                    bot_type,
                    status: KeyStatus::Unused,
                    created_by: admin_id.to_string(),
                    notes: notes.map(str::to_string),
                    redeemed_by: None,
                    redeemed_at: None,
                    bot_id: None,
                    created_at: Utc::now(),
                };
                match self.db.insert_activation_key(&key).await {
                    Ok(()) => break key,
                    Err(e) if e.is_unique_violation() && attempt < self.max_attempts => {
                        warn!("[Keys] Key collision on attempt {}/{}, regenerating", attempt, self.max_attempts);
                    }
                    Err(e) if e.is_unique_violation() => {
                        return Err(EngineError::KeyGenerationExhausted(self.max_attempts));
                    }
                    Err(e) => return Err(e),
                }
            };
            keys.push(key);
        }

        info!("[Keys] {} generated {} {} key(s)", admin_id, keys.len(), bot_type);
        self.activity
            .record_best_effort(
                None,
                ActivityAction::KeyGenerated,
                json!({
                    "bot_type": bot_type,
                    "admin_id": admin_id,
                    "count": keys.len(),
                    "notes": notes,
                }),
            )
            .await;

        Ok(keys)
    }

    /// Redeem a key for `user_id`. Concurrent redemptions of one key yield
    /// exactly one success; the others get `KeyAlreadyUsed`.
    pub async fn redeem(&self, key: &str, user_id: &str) -> EngineResult<ActivationKey> {
        let key = normalize(key);
        let redeemed = self.db.redeem_activation_key(&key, user_id).await?;
        info!("[Keys] {} redeemed a {} key", user_id, redeemed.bot_type);
        Ok(redeemed)
    }

    pub async fn revoke(&self, key: &str, admin_id: &str) -> EngineResult<()> {
        let key = normalize(key);
        self.db.revoke_activation_key(&key).await?;
        self.activity
            .record_best_effort(
                None,
                ActivityAction::KeyRevoked,
                json!({ "key": key, "admin_id": admin_id }),
            )
            .await;
        Ok(())
    }

    pub async fn lookup(&self, key: &str) -> EngineResult<ActivationKey> {
        self.db
            .get_activation_key(&normalize(key))
            .await?
            .ok_or(EngineError::KeyNotFound)
    }
}

/// `DCA-` or `GRID-` followed by grouped uppercase hex
fn random_key(bot_type: BotType) -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let body = hex::encode_upper(bytes);
    let groups: Vec<&str> = body
        .as_bytes()
        .chunks(5)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    format!("{}-{}", bot_type.as_str().to_uppercase(), groups.join("-"))
}

fn normalize(key: &str) -> String {
    key.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service(max_attempts: u32) -> ActivationService {
        let db = Arc::new(Database::in_memory().await.unwrap());
        ActivationService::new(db, max_attempts)
    }

    #[test]
    fn test_key_format() {
        let key = random_key(BotType::Grid);
        assert!(key.starts_with("GRID-"));
        // 20 hex chars in 4 groups of 5
        assert_eq!(key.len(), "GRID-".len() + 20 + 3);
        assert_eq!(key, normalize(&key.to_lowercase()));
    }

    #[tokio::test]
    async fn test_generate_and_redeem() {
        let svc = service(5).await;
        let keys = svc.generate(BotType::Dca, "admin", Some("promo"), 3).await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.status == KeyStatus::Unused));

        let redeemed = svc.redeem(&keys[0].key.to_lowercase(), "alice").await.unwrap();
        assert_eq!(redeemed.status, KeyStatus::Active);
        assert_eq!(redeemed.redeemed_by.as_deref(), Some("alice"));
        assert!(redeemed.redeemed_at.is_some());

        assert!(matches!(svc.redeem(&keys[0].key, "bob").await, Err(EngineError::KeyAlreadyUsed)));
        assert!(matches!(svc.redeem("DCA-NOPE", "bob").await, Err(EngineError::KeyNotFound)));
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_one_winner() {
        let svc = service(5).await;
        let key = svc.generate(BotType::Grid, "admin", None, 1).await.unwrap().remove(0);

        let (a, b) = tokio::join!(svc.redeem(&key.key, "user-a"), svc.redeem(&key.key, "user-b"));
        let results = [a, b];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let already_used = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::KeyAlreadyUsed)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(already_used, 1);

        // The loser left no trace
        let stored = svc.lookup(&key.key).await.unwrap();
        let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
        assert_eq!(stored.redeemed_by, winner.redeemed_by);
    }

    #[tokio::test]
    async fn test_collisions_are_retried_then_bounded() {
        let svc = service(3).await;
        svc.generate_with(BotType::Dca, "admin", None, 1, || "DCA-FIXED".to_string())
            .await
            .unwrap();

        // Two collisions, then a fresh key
        let mut calls = 0;
        let keys = svc
            .generate_with(BotType::Dca, "admin", None, 1, || {
                calls += 1;
                if calls < 3 {
                    "DCA-FIXED".to_string()
                } else {
                    "DCA-OTHER".to_string()
                }
            })
            .await
            .unwrap();
        assert_eq!(keys[0].key, "DCA-OTHER");

        let exhausted = svc
            .generate_with(BotType::Dca, "admin", None, 1, || "DCA-FIXED".to_string())
            .await;
        assert!(matches!(exhausted, Err(EngineError::KeyGenerationExhausted(3))));
    }

    #[tokio::test]
    async fn test_revoked_key_cannot_be_redeemed() {
        let svc = service(5).await;
        let key = svc.generate(BotType::Dca, "admin", None, 1).await.unwrap().remove(0);
        svc.revoke(&key.key, "admin").await.unwrap();
        assert!(matches!(
            svc.redeem(&key.key, "alice").await,
            Err(EngineError::KeyNotUsable(_))
        ));
    }
}
