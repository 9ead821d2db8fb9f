use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::Database;

/// Well-known meta key the settings JSON lives under.
const SETTINGS_KEY: &str = "app_settings";

/// Application-wide knobs persisted in the store so every process (CLI,
/// scheduler) sees the same values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    pub domain_discovery_auto_refresh: bool,
    /// Hours before a discovered domain list is considered stale, 1..=168.
    pub domain_discovery_refresh_hours: u32,
    pub scheduled_pull_enabled: bool,
    /// UTC hour of the daily scheduled pull, 0..=23.
    pub scheduled_pull_hour: u8,
    /// UTC minute of the daily scheduled pull, 0..=59.
    pub scheduled_pull_minute: u8,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            domain_discovery_auto_refresh: true,
            domain_discovery_refresh_hours: 24,
            scheduled_pull_enabled: true,
            scheduled_pull_hour: 1,
            scheduled_pull_minute: 0,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=168).contains(&self.domain_discovery_refresh_hours) {
            bail!(
                "domain_discovery_refresh_hours must be between 1 and 168, got {}",
                self.domain_discovery_refresh_hours
            );
        }
        if self.scheduled_pull_hour > 23 {
            bail!(
                "scheduled_pull_hour must be between 0 and 23, got {}",
                self.scheduled_pull_hour
            );
        }
        if self.scheduled_pull_minute > 59 {
            bail!(
                "scheduled_pull_minute must be between 0 and 59, got {}",
                self.scheduled_pull_minute
            );
        }
        Ok(())
    }

    /// Loads settings from the store, falling back to defaults when none have
    /// been saved yet. Stored values that fail validation are a config error,
    /// not silently replaced.
    pub fn load(db: &Database) -> Result<Self> {
        let settings = match db.get_meta(SETTINGS_KEY)? {
            Some(raw) => serde_json::from_str::<Self>(&raw)
                .with_context(|| format!("stored {SETTINGS_KEY} is not valid JSON"))?,
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, db: &Database) -> Result<()> {
        self.validate()?;
        let raw = serde_json::to_string(self)?;
        db.set_meta(SETTINGS_KEY, &raw)?;
        Ok(())
    }
}
