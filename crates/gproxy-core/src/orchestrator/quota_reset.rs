//! Periodic wall-clock reset of provider monthly quota and RPM counters,
//! spawned from bootstrap the same way `UnavailableQueue::spawn_recover_task`
//! runs its own background loop.

use std::sync::Arc;
use std::time::Duration;

use time::{Duration as TimeDuration, OffsetDateTime};

use gproxy_storage::{ProviderRow, Storage};

/// Wall-clock comparison the scheduler uses to decide a provider's monthly
/// counter is due: the current UTC day-of-month has reached
/// `quota_reset_day` and the last reset happened in an earlier month (or
/// never happened).
pub fn monthly_reset_due(provider: &ProviderRow, now: OffsetDateTime) -> bool {
    if now.day() < provider.quota_reset_day.clamp(1, 28) as u8 {
        return false;
    }
    match provider.quota_last_reset_at {
        None => true,
        Some(last) => {
            last.year() < now.year() || u8::from(last.month()) < u8::from(now.month())
        }
    }
}

/// Provider RPM resets every fixed window once `rpm_reset_at` has elapsed.
pub fn rpm_reset_due(provider: &ProviderRow, now: OffsetDateTime) -> bool {
    match provider.rpm_reset_at {
        None => true,
        Some(reset_at) => now > reset_at,
    }
}

pub struct QuotaResetConfig {
    pub check_interval: Duration,
    pub rpm_window: TimeDuration,
}

impl Default for QuotaResetConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            rpm_window: TimeDuration::minutes(1),
        }
    }
}

/// Spawns the background task. `providers` is re-read on every tick rather
/// than cached, so it always reflects the latest snapshot.
pub fn spawn(
    config: QuotaResetConfig,
    storage: Arc<dyn Storage>,
    providers: impl Fn() -> Vec<ProviderRow> + Send + Sync + 'static,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.check_interval);
        loop {
            ticker.tick().await;
            let now = OffsetDateTime::now_utc();
            for provider in providers() {
                if monthly_reset_due(&provider, now) {
                    let _ = storage.reset_provider_monthly_quota(provider.id, now).await;
                }
                if rpm_reset_due(&provider, now) {
                    let next = now + config.rpm_window;
                    let _ = storage.reset_provider_rpm(provider.id, next).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_storage::BillingType;

    fn provider(quota_last_reset_at: Option<OffsetDateTime>, quota_reset_day: i32) -> ProviderRow {
        ProviderRow {
            id: 1,
            name: "p".to_string(),
            config_json: serde_json::json!({}),
            enabled: true,
            priority: 0,
            billing_type: BillingType::MonthlyQuota,
            monthly_quota_usd: Some(100.0),
            monthly_used_usd: 50.0,
            quota_reset_day: quota_reset_day,
            quota_last_reset_at,
            rpm_limit: Some(60),
            rpm_used: 10,
            rpm_reset_at: Some(OffsetDateTime::UNIX_EPOCH),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn never_reset_is_due_once_day_reached() {
        let now = OffsetDateTime::UNIX_EPOCH + TimeDuration::days(10);
        let p = provider(None, 1);
        assert!(monthly_reset_due(&p, now));
    }

    #[test]
    fn not_due_before_reset_day() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let p = provider(None, 28);
        assert!(!monthly_reset_due(&p, now));
    }

    #[test]
    fn not_due_again_within_same_month() {
        let now = OffsetDateTime::UNIX_EPOCH + TimeDuration::days(5);
        let p = provider(Some(now - TimeDuration::days(1)), 1);
        assert!(!monthly_reset_due(&p, now));
    }

    #[test]
    fn due_again_after_month_rolls_over() {
        let last = OffsetDateTime::UNIX_EPOCH;
        let now = last + TimeDuration::days(40);
        let p = provider(Some(last), 1);
        assert!(monthly_reset_due(&p, now));
    }

    #[test]
    fn rpm_due_once_window_elapsed() {
        let p = provider(None, 1);
        let now = p.rpm_reset_at.unwrap() + TimeDuration::seconds(1);
        assert!(rpm_reset_due(&p, now));
        assert!(!rpm_reset_due(&p, p.rpm_reset_at.unwrap() - TimeDuration::seconds(1)));
    }
}
