use anyhow::{bail, Result};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clients::{client_for_method, ClientError, TraceClient};
use crate::db::models::{ApiMethod, PullStatus, Tenant, TriggerType};
use crate::db::Database;
use crate::domains::{discover_domains, domains_stale, resolve_domains};
use crate::normalize::normalize;
use crate::reconcile::reconcile;
use crate::settings::AppSettings;

/// Exchange Online retains message traces for this many days; older ranges
/// cannot be pulled.
pub const RETENTION_DAYS: i64 = 10;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Pull the last N days up to now; ignored when start/end are explicit.
    pub days: Option<u32>,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub dry_run: bool,
}

impl PullRequest {
    pub fn manual(triggered_by: &str) -> Self {
        Self {
            start: None,
            end: None,
            days: None,
            trigger_type: TriggerType::Manual,
            triggered_by: triggered_by.to_string(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub tenant: String,
    pub pull_history_id: Option<i64>,
    pub status: PullStatus,
    pub range_start: String,
    pub range_end: String,
    pub records_pulled: u64,
    pub records_new: u64,
    pub records_updated: u64,
    pub api_method: String,
    pub error_message: String,
}

/// Builds transports for a pull; injectable so tests can run the orchestrator
/// against fakes.
pub type ClientFactory<'a> =
    &'a dyn Fn(ApiMethod, &Tenant) -> Result<Box<dyn TraceClient>, ClientError>;

/// Resolves and validates the pull window. Explicit bounds win, then a
/// trailing `days` window, then the prior full UTC day. Inverted ranges and
/// ranges older than the vendor retention horizon are rejected here, before
/// any credential use or bookkeeping.
pub fn resolve_range(
    req: &PullRequest,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = match (req.start, req.end, req.days) {
        (Some(start), Some(end), _) => (start, end),
        (Some(start), None, _) => (start, now),
        (None, Some(end), _) => (end - Duration::days(1), end),
        (None, None, Some(days)) => (now - Duration::days(i64::from(days)), now),
        (None, None, None) => {
            let today = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
            let today = Utc.from_utc_datetime(&today);
            (today - Duration::days(1), today)
        }
    };

    if start >= end {
        bail!(
            "invalid range: start {} is not before end {}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }

    let horizon = now - Duration::days(RETENTION_DAYS);
    if start < horizon {
        bail!(
            "range start {} is older than the {RETENTION_DAYS}-day trace retention window \
             (earliest {})",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            horizon.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }

    Ok((start, end))
}

pub async fn pull_tenant(
    db: &Database,
    settings: &AppSettings,
    tenant: &Tenant,
    req: &PullRequest,
) -> Result<PullOutcome> {
    pull_tenant_with_factory(db, settings, tenant, req, &client_for_method).await
}

pub async fn pull_tenant_with_factory(
    db: &Database,
    settings: &AppSettings,
    tenant: &Tenant,
    req: &PullRequest,
    factory: ClientFactory<'_>,
) -> Result<PullOutcome> {
    let now = Utc::now();
    let (start, end) = resolve_range(req, now)?;
    let range_start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let range_end = end.to_rfc3339_opts(SecondsFormat::Secs, true);

    if req.dry_run {
        info!(
            tenant = %tenant.name,
            %range_start,
            %range_end,
            "dry run, no pull performed"
        );
        return Ok(PullOutcome {
            tenant: tenant.name.clone(),
            pull_history_id: None,
            status: PullStatus::Success,
            range_start,
            range_end,
            records_pulled: 0,
            records_new: 0,
            records_updated: 0,
            api_method: tenant.api_method.to_string(),
            error_message: String::new(),
        });
    }

    let started_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let pull_id = db.create_pull(
        Some(tenant.id),
        &started_at,
        &range_start,
        &range_end,
        req.trigger_type,
        &req.triggered_by,
        &tenant.api_method.to_string(),
    )?;

    let mut api_method = tenant.api_method.to_string();
    let result = run_pull(db, settings, tenant, start, end, &mut api_method, factory).await;
    if api_method != tenant.api_method.to_string() {
        db.set_pull_api_method(pull_id, &api_method)?;
    }

    let ended_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    match result {
        Ok(counts) => {
            db.finish_pull(
                pull_id,
                PullStatus::Success,
                &ended_at,
                counts.pulled as i64,
                counts.new as i64,
                counts.updated as i64,
                "",
            )?;
            info!(
                tenant = %tenant.name,
                pulled = counts.pulled,
                new = counts.new,
                updated = counts.updated,
                skipped = counts.skipped,
                %api_method,
                "pull finished"
            );
            Ok(PullOutcome {
                tenant: tenant.name.clone(),
                pull_history_id: Some(pull_id),
                status: PullStatus::Success,
                range_start,
                range_end,
                records_pulled: counts.pulled,
                records_new: counts.new,
                records_updated: counts.updated,
                api_method,
                error_message: String::new(),
            })
        }
        Err(e) => {
            let message = describe_pull_error(&e);
            error!(tenant = %tenant.name, error = %message, "pull failed");
            db.finish_pull(pull_id, PullStatus::Failed, &ended_at, 0, 0, 0, &message)?;
            Ok(PullOutcome {
                tenant: tenant.name.clone(),
                pull_history_id: Some(pull_id),
                status: PullStatus::Failed,
                range_start,
                range_end,
                records_pulled: 0,
                records_new: 0,
                records_updated: 0,
                api_method,
                error_message: message,
            })
        }
    }
}

struct PullCounts {
    pulled: u64,
    new: u64,
    updated: u64,
    skipped: u64,
}

async fn run_pull(
    db: &Database,
    settings: &AppSettings,
    tenant: &Tenant,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    api_method: &mut String,
    factory: ClientFactory<'_>,
) -> Result<PullCounts> {
    let mut client = factory(tenant.api_method, tenant)?;
    client.authenticate().await?;

    // Refresh the domain list opportunistically; a failed refresh degrades
    // classification, not the pull.
    let tenant = refresh_domains_if_stale(db, settings, tenant, client.as_mut()).await;
    let internal_domains = resolve_domains(&tenant);
    if internal_domains.is_empty() {
        warn!(
            tenant = %tenant.name,
            "no internal domains configured; traces will classify as Unknown"
        );
    }

    let traces = match client.fetch_traces(start, end, DEFAULT_PAGE_SIZE).await {
        Ok(traces) => traces,
        Err(ClientError::CapabilityNotAvailable(reason)) => {
            if tenant.organization_value().is_none() {
                bail!(
                    "the Graph message trace endpoint is not available for tenant '{}' \
                     ({reason}); set the tenant's organization to enable the PowerShell \
                     fallback, or set api_method to powershell",
                    tenant.name
                );
            }
            warn!(
                tenant = %tenant.name,
                %reason,
                "graph trace endpoint unavailable, falling back to powershell"
            );
            client = factory(ApiMethod::Powershell, &tenant)?;
            client.authenticate().await?;
            *api_method = ApiMethod::Powershell.to_string();
            client.fetch_traces(start, end, DEFAULT_PAGE_SIZE).await?
        }
        Err(e) => return Err(e.into()),
    };

    let normalized: Vec<_> = traces
        .iter()
        .map(|raw| normalize(raw, client.source()))
        .collect();

    let trace_date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let outcome = reconcile(db, &tenant, &normalized, &internal_domains, &trace_date)?;

    Ok(PullCounts {
        pulled: traces.len() as u64,
        new: outcome.new,
        updated: outcome.updated,
        skipped: outcome.skipped,
    })
}

/// Re-discovers verified domains when auto-refresh is on and the stored list
/// has gone stale. Returns the tenant, re-read when the list changed.
async fn refresh_domains_if_stale(
    db: &Database,
    settings: &AppSettings,
    tenant: &Tenant,
    client: &mut dyn TraceClient,
) -> Tenant {
    if !settings.domain_discovery_auto_refresh
        || !domains_stale(tenant, settings.domain_discovery_refresh_hours, Utc::now())
    {
        return tenant.clone();
    }

    match discover_domains(db, client, tenant, true, false).await {
        Ok(crate::domains::DiscoverOutcome::Updated { domains }) => {
            info!(tenant = %tenant.name, count = domains.len(), "refreshed stale domain list");
            match db.get_tenant(tenant.id) {
                Ok(Some(fresh)) => fresh,
                _ => tenant.clone(),
            }
        }
        Ok(_) => tenant.clone(),
        Err(e) => {
            warn!(tenant = %tenant.name, error = %e, "domain auto-refresh failed, continuing");
            tenant.clone()
        }
    }
}

fn describe_pull_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<ClientError>() {
        Some(ClientError::Auth(_)) => format!("Authentication error: {e}"),
        Some(ClientError::Config(_)) => format!("Configuration error: {e}"),
        Some(ClientError::Timeout { .. }) => format!("Timeout error: {e}"),
        Some(_) => format!("API error: {e}"),
        None => format!("Unexpected error: {e}"),
    }
}

/// Pulls every active tenant; one tenant's failure is recorded in its own
/// PullHistory row and does not stop the rest.
pub async fn pull_all_tenants(
    db: &Database,
    settings: &AppSettings,
    req: &PullRequest,
) -> Result<Vec<PullOutcome>> {
    pull_all_tenants_with_factory(db, settings, req, &client_for_method).await
}

pub async fn pull_all_tenants_with_factory(
    db: &Database,
    settings: &AppSettings,
    req: &PullRequest,
    factory: ClientFactory<'_>,
) -> Result<Vec<PullOutcome>> {
    let tenants = db.list_tenants(true)?;
    let mut outcomes = Vec::with_capacity(tenants.len());

    for tenant in &tenants {
        match pull_tenant_with_factory(db, settings, tenant, req, factory).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!(tenant = %tenant.name, error = %e, "pull aborted before bookkeeping");
                outcomes.push(PullOutcome {
                    tenant: tenant.name.clone(),
                    pull_history_id: None,
                    status: PullStatus::Failed,
                    range_start: String::new(),
                    range_end: String::new(),
                    records_pulled: 0,
                    records_new: 0,
                    records_updated: 0,
                    api_method: tenant.api_method.to_string(),
                    error_message: e.to_string(),
                });
            }
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{describe_pull_error, resolve_range, PullRequest};
    use crate::clients::ClientError;
    use crate::db::models::TriggerType;

    fn request() -> PullRequest {
        PullRequest {
            start: None,
            end: None,
            days: None,
            trigger_type: TriggerType::Manual,
            triggered_by: "test".to_string(),
            dry_run: false,
        }
    }

    #[test]
    fn default_range_is_the_prior_full_utc_day() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 15, 30, 0).unwrap();
        let (start, end) = resolve_range(&request(), now).expect("resolve");
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 9, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn days_window_ends_now() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 15, 30, 0).unwrap();
        let mut req = request();
        req.days = Some(3);
        let (start, end) = resolve_range(&req, now).expect("resolve");
        assert_eq!(end, now);
        assert_eq!(start, now - Duration::days(3));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let mut req = request();
        req.start = Some(now - Duration::days(1));
        req.end = Some(now - Duration::days(2));
        let err = resolve_range(&req, now).err().expect("rejected");
        assert!(err.to_string().contains("not before"));
    }

    #[test]
    fn ranges_beyond_retention_are_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let mut req = request();
        req.start = Some(now - Duration::days(11));
        req.end = Some(now - Duration::days(10));
        let err = resolve_range(&req, now).err().expect("rejected");
        assert!(err.to_string().contains("retention"));

        // Exactly at the horizon is allowed.
        let mut req = request();
        req.start = Some(now - Duration::days(10));
        req.end = Some(now - Duration::days(9));
        assert!(resolve_range(&req, now).is_ok());
    }

    #[test]
    fn error_prefixes_distinguish_client_error_kinds() {
        let cases = [
            (ClientError::Auth("denied".to_string()), "Authentication error:"),
            (ClientError::Config("no key".to_string()), "Configuration error:"),
            (ClientError::Timeout { seconds: 600 }, "Timeout error:"),
            (ClientError::Api("boom".to_string()), "API error:"),
        ];
        for (error, prefix) in cases {
            let described = describe_pull_error(&anyhow::Error::new(error));
            assert!(described.starts_with(prefix), "got {described}");
        }

        let other = describe_pull_error(&anyhow::anyhow!("something else"));
        assert!(other.starts_with("Unexpected error:"));
    }
}
