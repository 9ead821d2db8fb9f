use std::path::PathBuf;

use serde_json::json;
use uuid::Uuid;

use eta::db::models::{ApiMethod, AuthMethod, Direction};
use eta::db::{Database, NewTenant, TraceFilters};
use eta::normalize::{normalize, SourceKind};
use eta::reconcile::{reconcile, recompute_directions};
use eta::settings::AppSettings;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("eta-store-it-{}.db", Uuid::new_v4()))
}

fn add_tenant(db: &Database, name: &str, domains: &str) -> i64 {
    db.insert_tenant(&NewTenant {
        name: name.to_string(),
        tenant_id: format!("{name}-tenant-guid"),
        client_id: format!("{name}-client-guid"),
        auth_method: AuthMethod::Secret,
        client_secret: Some("s3cr3t".to_string()),
        certificate_path: None,
        certificate_thumbprint: None,
        certificate_password: None,
        api_method: ApiMethod::Graph,
        organization: None,
        domains: Some(domains.to_string()),
    })
    .expect("insert tenant")
}

fn graph_trace(message_id: &str, sender: &str, recipient: &str, status: &str) -> serde_json::Value {
    json!({
        "messageId": message_id,
        "receivedDateTime": "2026-02-01T12:00:00Z",
        "senderAddress": sender,
        "recipientAddress": recipient,
        "subject": "Budget review",
        "status": status,
        "size": 2048,
    })
}

#[test]
fn store_reconcile_and_query_pipeline() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant_id = add_tenant(&db, "contoso", "contoso.com");
    let tenant = db.get_tenant(tenant_id).expect("get").expect("row");

    let normalized: Vec<_> = [
        graph_trace("m1", "alice@contoso.com", "bob@fabrikam.com", "Delivered"),
        graph_trace("m2", "dave@fabrikam.com", "alice@contoso.com", "Failed"),
        graph_trace("m3", "alice@contoso.com", "erin@contoso.com", "Delivered"),
    ]
    .iter()
    .map(|raw| normalize(raw, SourceKind::Graph))
    .collect();

    let domains = vec!["contoso.com".to_string()];
    let outcome = reconcile(&db, &tenant, &normalized, &domains, "2026-02-02T00:00:00Z")
        .expect("reconcile");
    assert_eq!(outcome.new, 3);

    let outbound = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant_id),
            direction: Some("Outbound".to_string()),
            ..TraceFilters::default()
        })
        .expect("search outbound");
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].recipient, "bob@fabrikam.com");

    let failed = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant_id),
            status: Some("Failed".to_string()),
            ..TraceFilters::default()
        })
        .expect("search failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sender, "dave@fabrikam.com");

    let by_query = db
        .search_traces(TraceFilters {
            query: Some("Budget".to_string()),
            ..TraceFilters::default()
        })
        .expect("search query");
    assert_eq!(by_query.len(), 3);

    let stats = db.get_stats().expect("stats");
    assert_eq!(stats.total_tenants, 1);
    assert_eq!(stats.total_traces, 3);
    assert!(stats
        .traces_by_direction
        .iter()
        .any(|row| row.direction == "Internal" && row.count == 1));
}

#[test]
fn direction_recompute_follows_domain_changes() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant_id = add_tenant(&db, "contoso", "contoso.com");
    let tenant = db.get_tenant(tenant_id).expect("get").expect("row");

    let normalized: Vec<_> = [
        graph_trace("m1", "alice@contoso.com", "bob@fabrikam.com", "Delivered"),
        graph_trace("m2", "alice@contoso.com", "erin@contoso.com", "Delivered"),
    ]
    .iter()
    .map(|raw| normalize(raw, SourceKind::Graph))
    .collect();
    reconcile(
        &db,
        &tenant,
        &normalized,
        &["contoso.com".to_string()],
        "2026-02-02T00:00:00Z",
    )
    .expect("reconcile");

    // fabrikam.com becomes internal; m1 should flip Outbound -> Internal.
    let wider = vec!["contoso.com".to_string(), "fabrikam.com".to_string()];
    let preview = recompute_directions(&db, &tenant, &wider, 0, true).expect("dry run");
    assert_eq!(preview.examined, 2);
    assert_eq!(preview.changed, 1);

    let untouched = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant_id),
            direction: Some("Outbound".to_string()),
            ..TraceFilters::default()
        })
        .expect("search");
    assert_eq!(untouched.len(), 1, "dry run must not write");

    let applied = recompute_directions(&db, &tenant, &wider, 0, false).expect("apply");
    assert_eq!(applied.changed, 1);
    assert_eq!(applied.by_direction.get("Internal"), Some(&1));

    let internal = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant_id),
            direction: Some(Direction::Internal.to_string()),
            ..TraceFilters::default()
        })
        .expect("search");
    assert_eq!(internal.len(), 2);
}

#[test]
fn removing_a_tenant_cascades_to_its_traces() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let contoso = add_tenant(&db, "contoso", "contoso.com");
    let fabrikam = add_tenant(&db, "fabrikam", "fabrikam.com");

    for (tenant_id, sender) in [(contoso, "a@contoso.com"), (fabrikam, "a@fabrikam.com")] {
        let tenant = db.get_tenant(tenant_id).expect("get").expect("row");
        let normalized = vec![normalize(
            &graph_trace("m1", sender, "b@external.example", "Delivered"),
            SourceKind::Graph,
        )];
        reconcile(
            &db,
            &tenant,
            &normalized,
            &["contoso.com".to_string()],
            "2026-02-02T00:00:00Z",
        )
        .expect("reconcile");
    }

    assert_eq!(db.remove_tenant(contoso).expect("remove"), 1);

    let remaining = db.search_traces(TraceFilters::default()).expect("search");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].tenant_id, fabrikam);
}

#[test]
fn settings_roundtrip_through_the_store() {
    let db = Database::open(&temp_db_path()).expect("open db");

    let loaded = AppSettings::load(&db).expect("defaults when unset");
    assert_eq!(loaded, AppSettings::default());

    let mut settings = AppSettings::default();
    settings.scheduled_pull_hour = 3;
    settings.scheduled_pull_minute = 30;
    settings.domain_discovery_refresh_hours = 12;
    settings.save(&db).expect("save");

    let reloaded = AppSettings::load(&db).expect("reload");
    assert_eq!(reloaded, settings);

    settings.scheduled_pull_hour = 24;
    assert!(settings.save(&db).is_err(), "out-of-range hour must not persist");
}
