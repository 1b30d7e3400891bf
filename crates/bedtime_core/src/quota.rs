//! crates/bedtime_core/src/quota.rs
//!
//! Per-tier story quotas, checked before a story enters the pipeline.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Account, Story, StoryStatus, Tier};
use crate::ports::{AccountService, DatabaseService, PortResult};

pub const FREE_TIER_LIMIT: i64 = 10;
pub const DAILY_TIER_LIMIT: i64 = 7;
pub const FAMILY_TIER_LIMIT: i64 = 21;
/// Length of a free-tier window, counted from account creation.
pub const MONTH_DAYS: i64 = 30;

pub struct QuotaGate {
    accounts: Arc<dyn AccountService>,
    db: Arc<dyn DatabaseService>,
}

impl QuotaGate {
    pub fn new(accounts: Arc<dyn AccountService>, db: Arc<dyn DatabaseService>) -> Self {
        Self { accounts, db }
    }

    /// Whether `user_id` may start another story now. A denied `story` is marked failed.
    pub async fn admit(&self, user_id: Uuid, story: Option<&Story>) -> PortResult<bool> {
        self.admit_at(user_id, story, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        user_id: Uuid,
        story: Option<&Story>,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let account = self.accounts.get_account(user_id).await?;
        let exclude = story.map(|s| s.id);

        let allowed = match &account.tier {
            Tier::Unlimited => {
                debug!("User {} has unrestricted access", user_id);
                true
            }
            Tier::Free => {
                let (start, end) = free_window(&account, now);
                let used = self
                    .db
                    .count_stories_for_user(user_id, start, end, exclude)
                    .await?;
                log_usage(user_id, &account.tier, used, FREE_TIER_LIMIT);
                used < FREE_TIER_LIMIT
            }
            Tier::Daily | Tier::Family => {
                let limit = if account.tier == Tier::Daily {
                    DAILY_TIER_LIMIT
                } else {
                    FAMILY_TIER_LIMIT
                };
                let (start, end) = day_window(now);
                let used = self
                    .db
                    .count_stories_for_user(user_id, start, end, exclude)
                    .await?;
                log_usage(user_id, &account.tier, used, limit);
                used < limit
            }
            Tier::Unknown(tier) => {
                warn!("Unknown tier '{}' for user {}", tier, user_id);
                false
            }
        };

        if !allowed {
            if let Some(story) = story {
                let reason = format!("Story limit reached for the {} tier", account.tier.as_str());
                if self
                    .db
                    .update_story_status(story.id, StoryStatus::Failed, Some(&reason))
                    .await?
                {
                    info!("Updated story {} status to failed due to tier limit", story.id);
                }
            }
        }
        Ok(allowed)
    }
}

/// The 30-day window containing `now`, aligned to account creation.
pub fn free_window(account: &Account, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let months_passed = (now - account.created_at).num_days().max(0) / MONTH_DAYS;
    let start = account.created_at + Duration::days(months_passed * MONTH_DAYS);
    (start, start + Duration::days(MONTH_DAYS))
}

/// The UTC calendar day containing `now`.
pub fn day_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    (start, start + Duration::days(1))
}

fn log_usage(user_id: Uuid, tier: &Tier, used: i64, limit: i64) {
    if used >= limit {
        info!("{} tier user {} reached limit ({}/{})", tier.as_str(), user_id, used, limit);
    } else {
        debug!("{} tier user {} usage {}/{}", tier.as_str(), user_id, used, limit);
    }
}
