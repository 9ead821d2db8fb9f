use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use eta::clients::{ClientError, RawTrace, TraceClient};
use eta::db::models::{ApiMethod, AuthMethod, PullStatus, Tenant, TriggerType};
use eta::db::{Database, NewTenant, TraceFilters};
use eta::normalize::SourceKind;
use eta::pull::{pull_tenant_with_factory, PullRequest};
use eta::settings::AppSettings;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("eta-pull-it-{}.db", Uuid::new_v4()))
}

fn add_tenant(db: &Database, organization: Option<&str>) -> Tenant {
    let id = db
        .insert_tenant(&NewTenant {
            name: "contoso".to_string(),
            tenant_id: "11111111-1111-1111-1111-111111111111".to_string(),
            client_id: "22222222-2222-2222-2222-222222222222".to_string(),
            auth_method: AuthMethod::Secret,
            client_secret: Some("s3cr3t".to_string()),
            certificate_path: None,
            certificate_thumbprint: None,
            certificate_password: None,
            api_method: ApiMethod::Graph,
            organization: organization.map(str::to_string),
            domains: Some("contoso.com".to_string()),
        })
        .expect("insert tenant");
    db.get_tenant(id).expect("get tenant").expect("tenant row")
}

fn request() -> PullRequest {
    PullRequest {
        start: None,
        end: None,
        days: Some(1),
        trigger_type: TriggerType::Manual,
        triggered_by: "test".to_string(),
        dry_run: false,
    }
}

fn graph_trace(message_id: &str, sender: &str, recipient: &str) -> RawTrace {
    json!({
        "messageId": message_id,
        "receivedDateTime": "2026-02-01T12:00:00Z",
        "senderAddress": sender,
        "recipientAddress": recipient,
        "subject": "Quarterly report",
        "status": "Delivered",
        "size": 4096,
    })
}

fn powershell_trace(message_id: &str, sender: &str, recipient: &str) -> RawTrace {
    json!({
        "MessageId": message_id,
        "Received": "/Date(1769947200000)/",
        "SenderAddress": sender,
        "RecipientAddress": recipient,
        "Subject": "Quarterly report",
        "Status": "Delivered",
        "Size": 4096,
        "FromIP": "198.51.100.7",
    })
}

enum FetchPlan {
    Traces(Vec<RawTrace>),
    CapabilityMissing,
}

struct FakeClient {
    source: SourceKind,
    plan: FetchPlan,
}

#[async_trait(?Send)]
impl TraceClient for FakeClient {
    fn name(&self) -> &str {
        match self.source {
            SourceKind::Graph => "graph",
            SourceKind::Powershell => "powershell",
        }
    }

    fn source(&self) -> SourceKind {
        self.source
    }

    async fn authenticate(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn fetch_traces(
        &mut self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _page_size: usize,
    ) -> Result<Vec<RawTrace>, ClientError> {
        match &self.plan {
            FetchPlan::Traces(traces) => Ok(traces.clone()),
            FetchPlan::CapabilityMissing => Err(ClientError::CapabilityNotAvailable(
                "HTTP 404 from trace endpoint".to_string(),
            )),
        }
    }
}

#[tokio::test]
async fn pull_archives_traces_and_records_history() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let traces = vec![
        graph_trace("m1", "alice@contoso.com", "bob@fabrikam.com"),
        graph_trace("m1", "alice@contoso.com", "carol@fabrikam.com"),
    ];
    let factory = move |_method: ApiMethod,
                        _tenant: &Tenant|
          -> Result<Box<dyn TraceClient>, ClientError> {
        Ok(Box::new(FakeClient {
            source: SourceKind::Graph,
            plan: FetchPlan::Traces(traces.clone()),
        }))
    };

    let outcome = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("pull");

    assert_eq!(outcome.status, PullStatus::Success);
    assert_eq!(outcome.records_pulled, 2);
    assert_eq!(outcome.records_new, 2);
    assert_eq!(outcome.records_updated, 0);
    assert_eq!(outcome.api_method, "graph");

    let history = db
        .get_pull(outcome.pull_history_id.expect("history id"))
        .expect("get pull")
        .expect("history row");
    assert_eq!(history.status, PullStatus::Success);
    assert_eq!(history.records_new, 2);
    assert_eq!(history.api_method, "graph");
    assert!(history.ended_at.is_some());

    let archived = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant.id),
            ..TraceFilters::default()
        })
        .expect("search");
    assert_eq!(archived.len(), 2);
    for trace in &archived {
        assert_eq!(trace.direction.to_string(), "Outbound");
        assert_eq!(trace.status.to_string(), "Delivered");
    }
}

#[tokio::test]
async fn repeated_pull_updates_instead_of_duplicating() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let traces = vec![
        graph_trace("m1", "alice@contoso.com", "bob@fabrikam.com"),
        graph_trace("m2", "dave@fabrikam.com", "alice@contoso.com"),
    ];
    let factory = move |_method: ApiMethod,
                        _tenant: &Tenant|
          -> Result<Box<dyn TraceClient>, ClientError> {
        Ok(Box::new(FakeClient {
            source: SourceKind::Graph,
            plan: FetchPlan::Traces(traces.clone()),
        }))
    };

    let first = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("first pull");
    assert_eq!(first.records_new, 2);

    let second = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("second pull");
    assert_eq!(second.records_new, 0);
    assert_eq!(second.records_updated, 2);

    let archived = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant.id),
            ..TraceFilters::default()
        })
        .expect("search");
    assert_eq!(archived.len(), 2);
}

#[tokio::test]
async fn capability_missing_falls_back_to_powershell() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, Some("contoso.onmicrosoft.com"));
    let settings = AppSettings::default();

    let factory = |method: ApiMethod,
                   _tenant: &Tenant|
     -> Result<Box<dyn TraceClient>, ClientError> {
        match method {
            ApiMethod::Graph => Ok(Box::new(FakeClient {
                source: SourceKind::Graph,
                plan: FetchPlan::CapabilityMissing,
            })),
            ApiMethod::Powershell => Ok(Box::new(FakeClient {
                source: SourceKind::Powershell,
                plan: FetchPlan::Traces(vec![powershell_trace(
                    "m1",
                    "dave@fabrikam.com",
                    "alice@contoso.com",
                )]),
            })),
        }
    };

    let outcome = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("pull");

    assert_eq!(outcome.status, PullStatus::Success);
    assert_eq!(outcome.api_method, "powershell");
    assert_eq!(outcome.records_new, 1);

    let history = db
        .get_pull(outcome.pull_history_id.expect("history id"))
        .expect("get pull")
        .expect("history row");
    assert_eq!(history.api_method, "powershell");

    let archived = db
        .search_traces(TraceFilters {
            tenant_id: Some(tenant.id),
            ..TraceFilters::default()
        })
        .expect("search");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].received_at, "2026-02-01T12:00:00.000000Z");
    assert_eq!(archived[0].direction.to_string(), "Inbound");
}

#[tokio::test]
async fn capability_missing_without_organization_fails_with_remediation() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let factory = |_method: ApiMethod,
                   _tenant: &Tenant|
     -> Result<Box<dyn TraceClient>, ClientError> {
        Ok(Box::new(FakeClient {
            source: SourceKind::Graph,
            plan: FetchPlan::CapabilityMissing,
        }))
    };

    let outcome = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("pull returns an outcome, not an error");

    assert_eq!(outcome.status, PullStatus::Failed);
    assert!(outcome.error_message.contains("set the tenant's organization"));
    assert!(outcome.error_message.contains("powershell"));

    let history = db
        .get_pull(outcome.pull_history_id.expect("history id"))
        .expect("get pull")
        .expect("history row");
    assert_eq!(history.status, PullStatus::Failed);
    assert!(history.error_message.contains("organization"));
}

#[tokio::test]
async fn bad_records_are_skipped_without_failing_the_pull() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let traces = vec![
        graph_trace("m1", "alice@contoso.com", "bob@fabrikam.com"),
        json!({
            "messageId": "",
            "receivedDateTime": "2026-02-01T12:00:00Z",
            "senderAddress": "x@contoso.com",
            "recipientAddress": "y@fabrikam.com",
        }),
        json!({
            "messageId": "m3",
            "receivedDateTime": "not a timestamp",
            "senderAddress": "x@contoso.com",
            "recipientAddress": "y@fabrikam.com",
        }),
    ];
    let factory = move |_method: ApiMethod,
                        _tenant: &Tenant|
          -> Result<Box<dyn TraceClient>, ClientError> {
        Ok(Box::new(FakeClient {
            source: SourceKind::Graph,
            plan: FetchPlan::Traces(traces.clone()),
        }))
    };

    let outcome = pull_tenant_with_factory(&db, &settings, &tenant, &request(), &factory)
        .await
        .expect("pull");

    assert_eq!(outcome.status, PullStatus::Success);
    assert_eq!(outcome.records_pulled, 3);
    assert_eq!(outcome.records_new, 1);
}

#[tokio::test]
async fn dry_run_creates_no_history_and_calls_no_transport() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let factory = |_method: ApiMethod,
                   _tenant: &Tenant|
     -> Result<Box<dyn TraceClient>, ClientError> {
        panic!("transport must not be constructed during a dry run");
    };

    let mut req = request();
    req.dry_run = true;
    let outcome = pull_tenant_with_factory(&db, &settings, &tenant, &req, &factory)
        .await
        .expect("dry run");

    assert_eq!(outcome.status, PullStatus::Success);
    assert!(outcome.pull_history_id.is_none());
    assert_eq!(outcome.records_pulled, 0);

    let history = db.list_pull_history(None, 0).expect("history");
    assert!(history.is_empty());
}

#[tokio::test]
async fn ranges_outside_retention_are_rejected_before_any_bookkeeping() {
    let db = Database::open(&temp_db_path()).expect("open db");
    let tenant = add_tenant(&db, None);
    let settings = AppSettings::default();

    let factory = |_method: ApiMethod,
                   _tenant: &Tenant|
     -> Result<Box<dyn TraceClient>, ClientError> {
        panic!("transport must not be constructed for an invalid range");
    };

    let mut req = request();
    req.days = None;
    req.start = Some(Utc::now() - Duration::days(30));
    req.end = Some(Utc::now() - Duration::days(20));

    let err = pull_tenant_with_factory(&db, &settings, &tenant, &req, &factory)
        .await
        .expect_err("range outside retention");
    assert!(err.to_string().contains("retention"));

    let history = db.list_pull_history(None, 0).expect("history");
    assert!(history.is_empty());
}
