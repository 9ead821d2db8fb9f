use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use thiserror::Error;

use self::models::{Direction, MessageTrace, PullHistory, PullStatus, Tenant, TriggerType};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

/// Column set shared by every message_traces SELECT so `from_row` lookups
/// by name stay in sync.
const TRACE_COLUMNS: &str = "id, tenant_id, message_id, received_at, sender, recipient, subject, \
     status, direction, size, event_data, raw_json, trace_date";

const TENANT_COLUMNS: &str = "id, name, tenant_id, client_id, auth_method, client_secret, \
     certificate_path, certificate_thumbprint, certificate_password, api_method, organization, \
     domains, domains_last_updated, is_active";

const PULL_COLUMNS: &str = "id, tenant_id, started_at, ended_at, range_start, range_end, \
     records_pulled, records_new, records_updated, status, error_message, trigger_type, \
     triggered_by, api_method";

/// Tenant fields supplied at creation time; the row id is assigned by sqlite.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub auth_method: models::AuthMethod,
    pub client_secret: Option<String>,
    pub certificate_path: Option<String>,
    pub certificate_thumbprint: Option<String>,
    pub certificate_password: Option<String>,
    pub api_method: models::ApiMethod,
    pub organization: Option<String>,
    pub domains: Option<String>,
}

/// One reconciled trace ready to be written. Carries the natural key plus
/// every mutable column.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub tenant_id: i64,
    pub message_id: String,
    pub received_at: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub status: models::TraceStatus,
    pub direction: Direction,
    pub size: i64,
    pub event_data: serde_json::Value,
    pub raw_json: serde_json::Value,
    pub trace_date: String,
}

#[derive(Debug, Clone, Default)]
pub struct TraceFilters {
    pub tenant_id: Option<i64>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub status: Option<String>,
    pub direction: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub query: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantTraceCount {
    pub tenant: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectionCount {
    pub direction: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_tenants: i64,
    pub total_traces: i64,
    pub total_pulls: i64,
    pub traces_by_tenant: Vec<TenantTraceCount>,
    pub traces_by_direction: Vec<DirectionCount>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".eta").join("eta.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- tenants ----

    pub fn insert_tenant(&self, tenant: &NewTenant) -> Result<i64, DbError> {
        self.conn.execute(
            r#"
            INSERT INTO tenants (
                name, tenant_id, client_id, auth_method, client_secret, certificate_path,
                certificate_thumbprint, certificate_password, api_method, organization, domains
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                tenant.name,
                tenant.tenant_id,
                tenant.client_id,
                tenant.auth_method.to_string(),
                tenant.client_secret,
                tenant.certificate_path,
                tenant.certificate_thumbprint,
                tenant.certificate_password,
                tenant.api_method.to_string(),
                tenant.organization,
                tenant.domains,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_tenant(&self, id: i64) -> Result<Option<Tenant>, DbError> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ? LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Tenant::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_tenant_by_name(&self, name: &str) -> Result<Option<Tenant>, DbError> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE name = ? LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Tenant::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Resolves a CLI tenant selector: a numeric row id, else a tenant name.
    pub fn find_tenant(&self, selector: &str) -> Result<Option<Tenant>, DbError> {
        if let Ok(id) = selector.parse::<i64>() {
            if let Some(tenant) = self.get_tenant(id)? {
                return Ok(Some(tenant));
            }
        }
        self.get_tenant_by_name(selector)
    }

    pub fn list_tenants(&self, active_only: bool) -> Result<Vec<Tenant>, DbError> {
        let mut sql = format!("SELECT {TENANT_COLUMNS} FROM tenants");
        if active_only {
            sql.push_str(" WHERE is_active = true");
        }
        sql.push_str(" ORDER BY name ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let tenants = stmt
            .query_map([], Tenant::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }

    pub fn update_tenant_domains(
        &self,
        id: i64,
        domains: &str,
        updated_at: &str,
    ) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            r#"
            UPDATE tenants
            SET domains = ?, domains_last_updated = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![domains, updated_at, id],
        )?;
        Ok(changed)
    }

    pub fn set_tenant_active(&self, id: i64, active: bool) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            r#"
            UPDATE tenants
            SET is_active = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![active, id],
        )?;
        Ok(changed)
    }

    pub fn remove_tenant(&self, id: i64) -> Result<usize, DbError> {
        let deleted = self.conn.execute("DELETE FROM tenants WHERE id = ?", [id])?;
        Ok(deleted)
    }

    // ---- message traces ----

    /// Inserts a trace if its natural key is new. Returns true when a row was
    /// actually written.
    pub fn insert_trace(&self, trace: &TraceRecord) -> Result<bool, DbError> {
        let event_data = serde_json::to_string(&trace.event_data)?;
        let raw_json = serde_json::to_string(&trace.raw_json)?;

        let inserted = self.conn.execute(
            r#"
            INSERT INTO message_traces (
                tenant_id, message_id, received_at, sender, recipient, subject,
                status, direction, size, event_data, raw_json, trace_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, message_id, recipient, received_at) DO NOTHING
            "#,
            params![
                trace.tenant_id,
                trace.message_id,
                trace.received_at,
                trace.sender,
                trace.recipient,
                trace.subject,
                trace.status.to_string(),
                trace.direction.to_string(),
                trace.size,
                event_data,
                raw_json,
                trace.trace_date,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Refreshes the mutable columns of an existing trace, addressed by its
    /// natural key.
    pub fn update_trace(&self, trace: &TraceRecord) -> Result<usize, DbError> {
        let event_data = serde_json::to_string(&trace.event_data)?;
        let raw_json = serde_json::to_string(&trace.raw_json)?;

        let changed = self.conn.execute(
            r#"
            UPDATE message_traces
            SET sender = ?, subject = ?, status = ?, direction = ?, size = ?,
                event_data = ?, raw_json = ?, trace_date = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE tenant_id = ? AND message_id = ? AND recipient = ? AND received_at = ?
            "#,
            params![
                trace.sender,
                trace.subject,
                trace.status.to_string(),
                trace.direction.to_string(),
                trace.size,
                event_data,
                raw_json,
                trace.trace_date,
                trace.tenant_id,
                trace.message_id,
                trace.recipient,
                trace.received_at,
            ],
        )?;
        Ok(changed)
    }

    pub fn get_trace(
        &self,
        tenant_id: i64,
        message_id: &str,
        recipient: &str,
        received_at: &str,
    ) -> Result<Option<MessageTrace>, DbError> {
        let sql = format!(
            "SELECT {TRACE_COLUMNS} FROM message_traces \
             WHERE tenant_id = ? AND message_id = ? AND recipient = ? AND received_at = ? LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![tenant_id, message_id, recipient, received_at])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MessageTrace::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn trace_exists(
        &self,
        tenant_id: i64,
        message_id: &str,
        recipient: &str,
        received_at: &str,
    ) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM message_traces \
                 WHERE tenant_id = ? AND message_id = ? AND recipient = ? AND received_at = ? \
                 LIMIT 1",
                params![tenant_id, message_id, recipient, received_at],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn search_traces(&self, mut filters: TraceFilters) -> Result<Vec<MessageTrace>, DbError> {
        if filters.limit == 0 {
            filters.limit = 50;
        }

        let mut sql = format!("SELECT {TRACE_COLUMNS} FROM message_traces WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(tenant_id) = filters.tenant_id {
            sql.push_str(" AND tenant_id = ?");
            params_vec.push(Box::new(tenant_id));
        }

        if let Some(sender) = filters.sender {
            sql.push_str(" AND sender = ?");
            params_vec.push(Box::new(sender));
        }

        if let Some(recipient) = filters.recipient {
            sql.push_str(" AND recipient = ?");
            params_vec.push(Box::new(recipient));
        }

        if let Some(status) = filters.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status));
        }

        if let Some(direction) = filters.direction {
            sql.push_str(" AND direction = ?");
            params_vec.push(Box::new(direction));
        }

        if let Some(since) = filters.since {
            sql.push_str(" AND received_at >= ?");
            params_vec.push(Box::new(since));
        }

        if let Some(until) = filters.until {
            sql.push_str(" AND received_at < ?");
            params_vec.push(Box::new(until));
        }

        if let Some(query) = filters.query.filter(|s| !s.trim().is_empty()) {
            sql.push_str(" AND (subject LIKE ? OR message_id LIKE ? OR sender LIKE ? OR recipient LIKE ?)");
            let pattern = format!("%{query}%");
            for _ in 0..4 {
                params_vec.push(Box::new(pattern.clone()));
            }
        }

        sql.push_str(" ORDER BY received_at DESC LIMIT ? OFFSET ?");
        params_vec.push(Box::new(filters.limit as i64));
        params_vec.push(Box::new(filters.offset as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_refs.as_slice(), MessageTrace::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    /// Pages through a tenant's traces in id order for direction audits.
    pub fn traces_page(
        &self,
        tenant_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<MessageTrace>, DbError> {
        let sql = format!(
            "SELECT {TRACE_COLUMNS} FROM message_traces \
             WHERE tenant_id = ? AND id > ? ORDER BY id ASC LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map(
                params![tenant_id, after_id, limit as i64],
                MessageTrace::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    pub fn set_trace_direction(&self, id: i64, direction: Direction) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            r#"
            UPDATE message_traces
            SET direction = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![direction.to_string(), id],
        )?;
        Ok(changed)
    }

    // ---- pull history ----

    /// Records the start of a pull. The row stays in Running until
    /// `finish_pull` moves it to a terminal status.
    pub fn create_pull(
        &self,
        tenant_id: Option<i64>,
        started_at: &str,
        range_start: &str,
        range_end: &str,
        trigger_type: TriggerType,
        triggered_by: &str,
        api_method: &str,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            r#"
            INSERT INTO pull_history (
                tenant_id, started_at, range_start, range_end, status,
                trigger_type, triggered_by, api_method
            ) VALUES (?, ?, ?, ?, 'Running', ?, ?, ?)
            "#,
            params![
                tenant_id,
                started_at,
                range_start,
                range_end,
                trigger_type.to_string(),
                triggered_by,
                api_method,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_pull_api_method(&self, id: i64, api_method: &str) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE pull_history SET api_method = ? WHERE id = ?",
            params![api_method, id],
        )?;
        Ok(changed)
    }

    /// Moves a Running pull to a terminal status. A row that already left
    /// Running is not touched, so the first terminal transition wins.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_pull(
        &self,
        id: i64,
        status: PullStatus,
        ended_at: &str,
        records_pulled: i64,
        records_new: i64,
        records_updated: i64,
        error_message: &str,
    ) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            r#"
            UPDATE pull_history
            SET status = ?, ended_at = ?, records_pulled = ?, records_new = ?,
                records_updated = ?, error_message = ?
            WHERE id = ? AND status = 'Running'
            "#,
            params![
                status.to_string(),
                ended_at,
                records_pulled,
                records_new,
                records_updated,
                error_message,
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_pull(&self, id: i64) -> Result<Option<PullHistory>, DbError> {
        let sql = format!("SELECT {PULL_COLUMNS} FROM pull_history WHERE id = ? LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PullHistory::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_pull_history(
        &self,
        tenant_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<PullHistory>, DbError> {
        let limit = if limit == 0 { 20 } else { limit };

        let mut sql = format!("SELECT {PULL_COLUMNS} FROM pull_history");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(tenant_id) = tenant_id {
            sql.push_str(" WHERE tenant_id = ?");
            params_vec.push(Box::new(tenant_id));
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let history = stmt
            .query_map(params_refs.as_slice(), PullHistory::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(history)
    }

    // ---- meta ----

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DbError> {
        let value: Option<Option<String>> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO meta (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    // ---- stats ----

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let total_tenants: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get(0))?;
        let total_traces: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM message_traces", [], |row| row.get(0))?;
        let total_pulls: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM pull_history", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.name, COUNT(*) AS count
            FROM message_traces m
            JOIN tenants t ON t.id = m.tenant_id
            GROUP BY t.name
            ORDER BY count DESC
            "#,
        )?;
        let traces_by_tenant = stmt
            .query_map([], |row| {
                Ok(TenantTraceCount {
                    tenant: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT direction, COUNT(*) AS count FROM message_traces \
             GROUP BY direction ORDER BY count DESC",
        )?;
        let traces_by_direction = stmt
            .query_map([], |row| {
                Ok(DirectionCount {
                    direction: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(DatabaseStats {
            total_tenants,
            total_traces,
            total_pulls,
            traces_by_tenant,
            traces_by_direction,
        })
    }
}
