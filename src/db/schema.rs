use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL UNIQUE,
            client_id TEXT NOT NULL,
            auth_method TEXT NOT NULL CHECK(auth_method IN ('certificate', 'secret')),
            client_secret TEXT,
            certificate_path TEXT,
            certificate_thumbprint TEXT,
            certificate_password TEXT,
            api_method TEXT NOT NULL CHECK(api_method IN ('graph', 'powershell')),
            organization TEXT,
            domains TEXT,
            domains_last_updated TEXT,
            is_active BOOLEAN NOT NULL DEFAULT true,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS message_traces (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            message_id TEXT NOT NULL,
            received_at TEXT NOT NULL,
            sender TEXT NOT NULL DEFAULT '',
            recipient TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'Unknown',
            direction TEXT NOT NULL DEFAULT 'Unknown'
                CHECK(direction IN ('Inbound', 'Outbound', 'Internal', 'Unknown')),
            size INTEGER NOT NULL DEFAULT 0,
            event_data TEXT,
            raw_json TEXT,
            trace_date TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(tenant_id, message_id, recipient, received_at)
        );

        CREATE TABLE IF NOT EXISTS pull_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER REFERENCES tenants(id) ON DELETE CASCADE,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            range_start TEXT NOT NULL,
            range_end TEXT NOT NULL,
            records_pulled INTEGER NOT NULL DEFAULT 0,
            records_new INTEGER NOT NULL DEFAULT 0,
            records_updated INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'Running'
                CHECK(status IN ('Running', 'Success', 'Partial', 'Failed', 'Cancelled')),
            error_message TEXT NOT NULL DEFAULT '',
            trigger_type TEXT NOT NULL CHECK(trigger_type IN ('Scheduled', 'Manual')),
            triggered_by TEXT NOT NULL DEFAULT '',
            api_method TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_traces_tenant_received ON message_traces(tenant_id, received_at);
        CREATE INDEX IF NOT EXISTS idx_traces_sender ON message_traces(sender);
        CREATE INDEX IF NOT EXISTS idx_traces_recipient ON message_traces(recipient);
        CREATE INDEX IF NOT EXISTS idx_traces_status_direction ON message_traces(status, direction);
        CREATE INDEX IF NOT EXISTS idx_traces_trace_date ON message_traces(trace_date);
        CREATE INDEX IF NOT EXISTS idx_pull_history_started ON pull_history(started_at);
        CREATE INDEX IF NOT EXISTS idx_pull_history_tenant ON pull_history(tenant_id);
        "#,
    )?;

    Ok(())
}
