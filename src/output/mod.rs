pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::db::models::{MessageTrace, PullHistory, Tenant};
use crate::db::DatabaseStats;
use crate::pull::PullOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// Tenant view safe to print: credential material is never rendered.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    pub id: i64,
    pub name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub auth_method: String,
    pub api_method: String,
    pub organization: Option<String>,
    pub domains: Option<String>,
    pub domains_last_updated: Option<String>,
    pub is_active: bool,
}

impl TenantSummary {
    pub fn from_tenant(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id,
            name: tenant.name.clone(),
            tenant_id: tenant.tenant_id.clone(),
            client_id: tenant.client_id.clone(),
            auth_method: tenant.auth_method.to_string(),
            api_method: tenant.api_method.to_string(),
            organization: tenant.organization.clone(),
            domains: tenant.domains.clone(),
            domains_last_updated: tenant.domains_last_updated.clone(),
            is_active: tenant.is_active,
        }
    }
}

pub fn format_traces(format: OutputFormat, traces: &[MessageTrace]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_traces(traces)),
        OutputFormat::Json => json::format_traces(traces),
    }
}

pub fn format_tenants(format: OutputFormat, tenants: &[TenantSummary]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_tenants(tenants)),
        OutputFormat::Json => json::format_tenants(tenants),
    }
}

pub fn format_tenant(format: OutputFormat, tenant: &TenantSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_tenant(tenant)),
        OutputFormat::Json => json::format_tenant(tenant),
    }
}

pub fn format_history(format: OutputFormat, history: &[PullHistory]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_history(history)),
        OutputFormat::Json => json::format_history(history),
    }
}

pub fn format_pull_outcomes(format: OutputFormat, outcomes: &[PullOutcome]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_pull_outcomes(outcomes)),
        OutputFormat::Json => json::format_pull_outcomes(outcomes),
    }
}

pub fn format_stats(format: OutputFormat, stats: &DatabaseStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::format_stats(stats),
    }
}
