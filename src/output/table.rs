use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{MessageTrace, PullHistory};
use crate::db::DatabaseStats;
use crate::output::TenantSummary;
use crate::pull::PullOutcome;

const SENDER_WIDTH: usize = 28;
const RECIPIENT_WIDTH: usize = 28;
const SUBJECT_WIDTH: usize = 36;
const STATUS_WIDTH: usize = 14;
const DIRECTION_WIDTH: usize = 9;
const DATE_WIDTH: usize = 20;

pub fn format_traces(traces: &[MessageTrace]) -> String {
    if traces.is_empty() {
        return "No traces found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<date$}  {:<sender$}  {:<recipient$}  {:<subject$}  {:<status$}  {:<direction$}\n",
        "Received",
        "Sender",
        "Recipient",
        "Subject",
        "Status",
        "Direction",
        date = DATE_WIDTH,
        sender = SENDER_WIDTH,
        recipient = RECIPIENT_WIDTH,
        subject = SUBJECT_WIDTH,
        status = STATUS_WIDTH,
        direction = DIRECTION_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(DATE_WIDTH),
        "-".repeat(SENDER_WIDTH),
        "-".repeat(RECIPIENT_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(DIRECTION_WIDTH)
    ));

    for trace in traces {
        out.push_str(&format!(
            "{:<date$}  {:<sender$}  {:<recipient$}  {:<subject$}  {:<status$}  {:<direction$}\n",
            truncate_for_width(&trace.received_at, DATE_WIDTH),
            truncate_for_width(&trace.sender, SENDER_WIDTH),
            truncate_for_width(&trace.recipient, RECIPIENT_WIDTH),
            truncate_for_width(&trace.subject, SUBJECT_WIDTH),
            trace.status,
            trace.direction,
            date = DATE_WIDTH,
            sender = SENDER_WIDTH,
            recipient = RECIPIENT_WIDTH,
            subject = SUBJECT_WIDTH,
            status = STATUS_WIDTH,
            direction = DIRECTION_WIDTH
        ));
    }

    out
}

pub fn format_tenants(tenants: &[TenantSummary]) -> String {
    if tenants.is_empty() {
        return "No tenants configured.".to_string();
    }

    let mut out = String::new();
    out.push_str("ID    Name                      Auth         API         Active  Domains\n");
    out.push_str("----  ------------------------  -----------  ----------  ------  ------------------------------\n");
    for tenant in tenants {
        out.push_str(&format!(
            "{:<4}  {:<24}  {:<11}  {:<10}  {:<6}  {}\n",
            tenant.id,
            truncate_for_width(&tenant.name, 24),
            tenant.auth_method,
            tenant.api_method,
            if tenant.is_active { "yes" } else { "no" },
            truncate_for_width(tenant.domains.as_deref().unwrap_or("-"), 30),
        ));
    }
    out
}

pub fn format_tenant(tenant: &TenantSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID:           {}\n", tenant.id));
    out.push_str(&format!("Name:         {}\n", tenant.name));
    out.push_str(&format!("Tenant ID:    {}\n", tenant.tenant_id));
    out.push_str(&format!("Client ID:    {}\n", tenant.client_id));
    out.push_str(&format!("Auth method:  {}\n", tenant.auth_method));
    out.push_str(&format!("API method:   {}\n", tenant.api_method));
    out.push_str(&format!(
        "Organization: {}\n",
        tenant.organization.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "Domains:      {}\n",
        tenant.domains.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "Domains set:  {}\n",
        tenant.domains_last_updated.as_deref().unwrap_or("never")
    ));
    out.push_str(&format!(
        "Active:       {}\n",
        if tenant.is_active { "yes" } else { "no" }
    ));
    out
}

pub fn format_history(history: &[PullHistory]) -> String {
    if history.is_empty() {
        return "No pull history.".to_string();
    }

    let mut out = String::new();
    out.push_str(
        "ID      Started               Status     Trigger    Method      Pulled     New  Updated  Error\n",
    );
    out.push_str(
        "------  --------------------  ---------  ---------  ----------  ------  ------  -------  ------------------------------\n",
    );
    for pull in history {
        out.push_str(&format!(
            "{:<6}  {:<20}  {:<9}  {:<9}  {:<10}  {:>6}  {:>6}  {:>7}  {}\n",
            pull.id,
            truncate_for_width(&pull.started_at, 20),
            pull.status,
            pull.trigger_type,
            truncate_for_width(&pull.api_method, 10),
            pull.records_pulled,
            pull.records_new,
            pull.records_updated,
            truncate_for_width(&pull.error_message, 30),
        ));
    }
    out
}

pub fn format_pull_outcomes(outcomes: &[PullOutcome]) -> String {
    if outcomes.is_empty() {
        return "No tenants pulled.".to_string();
    }

    let mut out = String::new();
    for outcome in outcomes {
        out.push_str(&format!(
            "{}: {} [{}] range {} .. {} pulled={} new={} updated={}",
            outcome.tenant,
            outcome.status,
            outcome.api_method,
            outcome.range_start,
            outcome.range_end,
            outcome.records_pulled,
            outcome.records_new,
            outcome.records_updated,
        ));
        if !outcome.error_message.is_empty() {
            out.push_str(&format!(" error: {}", outcome.error_message));
        }
        out.push('\n');
    }
    out
}

pub fn format_stats(stats: &DatabaseStats) -> String {
    let mut out = String::new();
    out.push_str("ETA Stats\n");
    out.push_str("=========\n");
    out.push_str(&format!("Tenants: {}\n", stats.total_tenants));
    out.push_str(&format!("Traces:  {}\n", stats.total_traces));
    out.push_str(&format!("Pulls:   {}\n", stats.total_pulls));

    if !stats.traces_by_tenant.is_empty() {
        out.push('\n');
        out.push_str("Traces by tenant\n");
        out.push_str("----------------\n");
        for row in &stats.traces_by_tenant {
            out.push_str(&format!("{:<24} {:>8}\n", row.tenant, row.count));
        }
    }

    if !stats.traces_by_direction.is_empty() {
        out.push('\n');
        out.push_str("Traces by direction\n");
        out.push_str("-------------------\n");
        for row in &stats.traces_by_direction {
            out.push_str(&format!("{:<24} {:>8}\n", row.direction, row.count));
        }
    }

    out
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::db::models::{Direction, MessageTrace, TraceStatus};
    use crate::output::TenantSummary;

    use super::{format_tenants, format_traces, truncate_for_width};

    fn sample_trace() -> MessageTrace {
        MessageTrace {
            id: 1,
            tenant_id: 1,
            message_id: "<m@x>".to_string(),
            received_at: "2026-02-01T12:00:00.000000Z".to_string(),
            sender: "alice@contoso.com".to_string(),
            recipient: "bob@fabrikam.com".to_string(),
            subject: "A very long subject line that should be truncated in table output"
                .to_string(),
            status: TraceStatus::Delivered,
            direction: Direction::Outbound,
            size: 2048,
            event_data: json!({}),
            raw_json: json!({}),
            trace_date: "2026-02-02T01:00:00Z".to_string(),
        }
    }

    #[test]
    fn trace_table_has_headers_and_truncates_subjects() {
        let rendered = format_traces(&[sample_trace()]);
        assert!(rendered.contains("Sender"));
        assert!(rendered.contains("Direction"));
        assert!(rendered.contains('…'));
        assert!(!rendered.contains("truncated in table output"));
    }

    #[test]
    fn tenant_table_lists_methods_and_domains() {
        let summary = TenantSummary {
            id: 1,
            name: "contoso".to_string(),
            tenant_id: "tid".to_string(),
            client_id: "cid".to_string(),
            auth_method: "secret".to_string(),
            api_method: "graph".to_string(),
            organization: None,
            domains: Some("contoso.com".to_string()),
            domains_last_updated: None,
            is_active: true,
        };
        let rendered = format_tenants(&[summary]);
        assert!(rendered.contains("contoso"));
        assert!(rendered.contains("graph"));
        assert!(rendered.contains("contoso.com"));
    }

    #[test]
    fn truncation_respects_display_width() {
        assert_eq!(truncate_for_width("short", 10), "short");
        let cut = truncate_for_width("0123456789abcdef", 8);
        assert!(cut.ends_with('…'));
        assert!(cut.len() < 16);
    }
}
