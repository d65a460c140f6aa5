// Monthly execution quotas per subscription tier.
use crate::core::config::SubscriptionConfig;
use crate::core::time_utils::month_start_ts;
use crate::storage::{StorageBackend, UserRecord};
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UsageSummary {
    pub tier: String,
    pub monthly_limit: i64,
    pub used: i64,
    /// `None` when the tier is unlimited.
    pub remaining: Option<i64>,
}

impl UsageSummary {
    pub fn exhausted(&self) -> bool {
        matches!(self.remaining, Some(0))
    }
}

/// Effective tier: users without an active subscription drop to `free`.
pub fn effective_tier(user: &UserRecord) -> String {
    if !user.subscription_status.trim().eq_ignore_ascii_case("active") {
        return "free".to_string();
    }
    let tier = user.subscription_tier.trim().to_ascii_lowercase();
    if tier.is_empty() {
        "free".to_string()
    } else {
        tier
    }
}

pub fn monthly_limit(config: &SubscriptionConfig, tier: &str) -> i64 {
    match tier {
        "basic" => config.basic_monthly_tasks,
        "pro" => config.pro_monthly_tasks,
        "enterprise" => config.enterprise_monthly_tasks,
        _ => config.free_monthly_tasks,
    }
}

pub fn usage_summary(
    storage: &dyn StorageBackend,
    config: &SubscriptionConfig,
    user: &UserRecord,
    now: f64,
) -> Result<UsageSummary> {
    let tier = effective_tier(user);
    let limit = monthly_limit(config, &tier);
    let used = storage.count_executions_since(user.id, month_start_ts(now))?;
    let remaining = if limit < 0 {
        None
    } else {
        Some((limit - used).max(0))
    };
    Ok(UsageSummary {
        tier,
        monthly_limit: limit,
        used,
        remaining,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(tier: &str, status: &str) -> UserRecord {
        UserRecord {
            id: 1,
            username: "u".to_string(),
            email: "u@example.com".to_string(),
            full_name: None,
            password_hash: String::new(),
            role: "user".to_string(),
            subscription_tier: tier.to_string(),
            subscription_status: status.to_string(),
            is_active: true,
            is_verified: false,
            created_at: 0.0,
            updated_at: 0.0,
            last_login_at: None,
        }
    }

    #[test]
    fn inactive_subscription_falls_back_to_free() {
        assert_eq!(effective_tier(&user("pro", "active")), "pro");
        assert_eq!(effective_tier(&user("pro", "cancelled")), "free");
        assert_eq!(effective_tier(&user("", "active")), "free");
    }

    #[test]
    fn limits_follow_config() {
        let config = SubscriptionConfig::default();
        assert_eq!(monthly_limit(&config, "free"), 10);
        assert_eq!(monthly_limit(&config, "basic"), 100);
        assert_eq!(monthly_limit(&config, "pro"), 500);
        assert!(monthly_limit(&config, "enterprise") < 0);
        assert_eq!(monthly_limit(&config, "mystery"), 10);
    }
}
