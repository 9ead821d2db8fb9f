use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::db::models::TriggerType;
use crate::db::Database;
use crate::pull::{pull_all_tenants, PullRequest};
use crate::settings::AppSettings;

/// How long to wait before re-reading settings when scheduling is disabled
/// or the settings cannot be loaded.
const RECHECK_SECONDS: u64 = 300;

/// Long-lived scheduler loop. Settings are re-read from the store every
/// cycle, so changing the pull time or disabling the schedule takes effect
/// without a restart.
pub async fn run(db: &Database, run_now: bool) -> Result<()> {
    info!("scheduler started");

    if run_now {
        scheduled_fan_out(db).await;
    }

    loop {
        let settings = match AppSettings::load(db) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "failed to load settings, rechecking later");
                sleep(StdDuration::from_secs(RECHECK_SECONDS)).await;
                continue;
            }
        };

        if !settings.scheduled_pull_enabled {
            info!("scheduled pulls disabled, rechecking later");
            sleep(StdDuration::from_secs(RECHECK_SECONDS)).await;
            continue;
        }

        let now = Utc::now();
        let fire_at = next_fire(now, settings.scheduled_pull_hour, settings.scheduled_pull_minute);
        let wait = (fire_at - now)
            .to_std()
            .unwrap_or(StdDuration::from_secs(0));
        info!(fire_at = %fire_at, "next scheduled pull");
        sleep(wait).await;

        scheduled_fan_out(db).await;
    }
}

async fn scheduled_fan_out(db: &Database) {
    let settings = match AppSettings::load(db) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, "failed to load settings, skipping scheduled pull");
            return;
        }
    };

    let req = PullRequest {
        start: None,
        end: None,
        days: None,
        trigger_type: TriggerType::Scheduled,
        triggered_by: "system".to_string(),
        dry_run: false,
    };

    match pull_all_tenants(db, &settings, &req).await {
        Ok(outcomes) => {
            let failed = outcomes
                .iter()
                .filter(|o| o.status != crate::db::models::PullStatus::Success)
                .count();
            info!(
                tenants = outcomes.len(),
                failed,
                "scheduled pull fan-out finished"
            );
        }
        Err(e) => warn!(error = %e, "scheduled pull fan-out failed"),
    }
}

/// The next UTC occurrence of HH:MM strictly after `now`.
pub fn next_fire(now: DateTime<Utc>, hour: u8, minute: u8) -> DateTime<Utc> {
    let today = now.date_naive();
    let candidate = today
        .and_hms_opt(u32::from(hour), u32::from(minute), 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);

    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::next_fire;

    #[test]
    fn fires_later_today_when_time_has_not_passed() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 30, 0).unwrap();
        let fire = next_fire(now, 1, 0);
        assert_eq!(fire, Utc.with_ymd_and_hms(2026, 2, 10, 1, 0, 0).unwrap());
    }

    #[test]
    fn fires_tomorrow_when_time_already_passed() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 1, 0, 0).unwrap();
        let fire = next_fire(now, 1, 0);
        assert_eq!(fire, Utc.with_ymd_and_hms(2026, 2, 11, 1, 0, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2026, 2, 10, 23, 59, 0).unwrap();
        let fire = next_fire(later, 1, 0);
        assert_eq!(fire, Utc.with_ymd_and_hms(2026, 2, 11, 1, 0, 0).unwrap());
    }
}
