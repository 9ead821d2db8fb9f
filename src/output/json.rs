use anyhow::Result;

use crate::db::models::{MessageTrace, PullHistory};
use crate::db::DatabaseStats;
use crate::output::TenantSummary;
use crate::pull::PullOutcome;

pub fn format_traces(traces: &[MessageTrace]) -> Result<String> {
    Ok(serde_json::to_string_pretty(traces)?)
}

pub fn format_tenants(tenants: &[TenantSummary]) -> Result<String> {
    Ok(serde_json::to_string_pretty(tenants)?)
}

pub fn format_tenant(tenant: &TenantSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(tenant)?)
}

pub fn format_history(history: &[PullHistory]) -> Result<String> {
    Ok(serde_json::to_string_pretty(history)?)
}

pub fn format_pull_outcomes(outcomes: &[PullOutcome]) -> Result<String> {
    Ok(serde_json::to_string_pretty(outcomes)?)
}

pub fn format_stats(stats: &DatabaseStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(stats)?)
}
