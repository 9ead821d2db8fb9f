use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use crate::clients::TraceClient;
use crate::db::models::Tenant;
use crate::db::Database;

/// Resolves the internal domain list used for direction classification.
///
/// An explicitly configured list wins. Otherwise the organization name is
/// used as a domain itself, and an initial-tenant ".onmicrosoft.com" suffix
/// additionally synthesizes the ".com" base domain, so mail on either form
/// of address classifies as internal. No configuration at all yields an
/// empty list.
pub fn resolve_domains(tenant: &Tenant) -> Vec<String> {
    if let Some(raw) = tenant.domains.as_deref() {
        let parsed = split_domain_list(raw);
        if !parsed.is_empty() {
            return parsed;
        }
    }

    match tenant.organization_value() {
        Some(org) => {
            let org = org.to_ascii_lowercase();
            let mut domains = vec![org.clone()];
            if let Some(base) = org.strip_suffix(".onmicrosoft.com") {
                let base = format!("{base}.com");
                if !domains.contains(&base) {
                    domains.push(base);
                }
            }
            domains
        }
        None => Vec::new(),
    }
}

/// Splits a comma-separated domain list, trimming, lowercasing, and keeping
/// the first occurrence of each domain.
pub fn split_domain_list(raw: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for part in raw.split(',') {
        let domain = part.trim().to_ascii_lowercase();
        if !domain.is_empty() && !seen.contains(&domain) {
            seen.push(domain);
        }
    }
    seen
}

/// A tenant's domain list is stale when it has never been discovered or when
/// the last discovery is older than the configured refresh window.
pub fn domains_stale(tenant: &Tenant, refresh_hours: u32, now: DateTime<Utc>) -> bool {
    match tenant
        .domains_last_updated
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    {
        Some(updated) => {
            now - updated.with_timezone(&Utc) > Duration::hours(i64::from(refresh_hours))
        }
        None => true,
    }
}

/// Outcome of a domain discovery attempt against the tenant's API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DiscoverOutcome {
    /// Domains were fetched and written to the tenant record.
    Updated { domains: Vec<String> },
    /// Dry run: these domains would have been written.
    WouldUpdate { domains: Vec<String> },
    /// The tenant already has an explicit list and overwrite was not requested.
    SkippedConfigured,
    /// The transport cannot enumerate verified domains.
    NotSupported,
    /// The API returned no verified domains; the tenant record is untouched.
    Empty,
}

/// Fetches the tenant's verified domains and persists them as the internal
/// domain list. An already-configured list is skipped unless `overwrite` is
/// set; a transport without the capability reports NotSupported.
pub async fn discover_domains(
    db: &Database,
    client: &mut dyn TraceClient,
    tenant: &Tenant,
    overwrite: bool,
    dry_run: bool,
) -> anyhow::Result<DiscoverOutcome> {
    if tenant.domains.as_deref().is_some_and(|d| !d.trim().is_empty()) && !overwrite {
        return Ok(DiscoverOutcome::SkippedConfigured);
    }

    let domains = match client.list_verified_domains().await {
        Ok(domains) => domains,
        Err(crate::clients::ClientError::NotSupported) => {
            return Ok(DiscoverOutcome::NotSupported)
        }
        Err(e) => return Err(e.into()),
    };

    let mut cleaned: Vec<String> = Vec::new();
    for raw in &domains {
        for domain in split_domain_list(raw) {
            if !cleaned.contains(&domain) {
                cleaned.push(domain);
            }
        }
    }
    let domains = cleaned;
    if domains.is_empty() {
        return Ok(DiscoverOutcome::Empty);
    }

    if dry_run {
        return Ok(DiscoverOutcome::WouldUpdate { domains });
    }

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    db.update_tenant_domains(tenant.id, &domains.join(","), &now)?;
    info!(tenant = %tenant.name, count = domains.len(), "updated tenant domains");
    Ok(DiscoverOutcome::Updated { domains })
}
