use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Message direction relative to a tenant's internal domains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
    Unknown,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "Inbound"),
            Self::Outbound => write!(f, "Outbound"),
            Self::Internal => write!(f, "Internal"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "internal" => Ok(Self::Internal),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("invalid direction: {other}")),
        }
    }
}

/// Canonical delivery status vocabulary. Vendor status strings outside this
/// set map to `Unknown` rather than failing the record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TraceStatus {
    Delivered,
    Failed,
    Pending,
    Expanded,
    Quarantined,
    FilteredAsSpam,
    None,
    Unknown,
}

impl Display for TraceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivered => write!(f, "Delivered"),
            Self::Failed => write!(f, "Failed"),
            Self::Pending => write!(f, "Pending"),
            Self::Expanded => write!(f, "Expanded"),
            Self::Quarantined => write!(f, "Quarantined"),
            Self::FilteredAsSpam => write!(f, "FilteredAsSpam"),
            Self::None => write!(f, "None"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            "expanded" => Ok(Self::Expanded),
            "quarantined" => Ok(Self::Quarantined),
            "filteredasspam" => Ok(Self::FilteredAsSpam),
            "none" => Ok(Self::None),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("invalid trace status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Certificate,
    Secret,
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Certificate => write!(f, "certificate"),
            Self::Secret => write!(f, "secret"),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "certificate" | "cert" => Ok(Self::Certificate),
            "secret" => Ok(Self::Secret),
            other => Err(format!("invalid auth method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiMethod {
    Graph,
    Powershell,
}

impl Display for ApiMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph => write!(f, "graph"),
            Self::Powershell => write!(f, "powershell"),
        }
    }
}

impl FromStr for ApiMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graph" => Ok(Self::Graph),
            "powershell" | "ps" => Ok(Self::Powershell),
            other => Err(format!("invalid api method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullStatus {
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl Display for PullStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Success => write!(f, "Success"),
            Self::Partial => write!(f, "Partial"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl FromStr for PullStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid pull status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl Display for TriggerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(format!("invalid trigger type: {other}")),
        }
    }
}

/// One Microsoft 365 tenant's connection configuration. Which credential
/// fields are required depends on `auth_method`; validation happens when a
/// transport client is constructed, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// Entra ID tenant GUID.
    pub tenant_id: String,
    /// Entra ID application (client) GUID.
    pub client_id: String,
    pub auth_method: AuthMethod,
    pub client_secret: Option<String>,
    pub certificate_path: Option<String>,
    pub certificate_thumbprint: Option<String>,
    pub certificate_password: Option<String>,
    pub api_method: ApiMethod,
    /// Exchange organization name, e.g. "contoso.onmicrosoft.com".
    pub organization: Option<String>,
    /// Comma-separated internal domains for direction classification.
    pub domains: Option<String>,
    pub domains_last_updated: Option<String>,
    pub is_active: bool,
}

impl Tenant {
    pub fn organization_value(&self) -> Option<&str> {
        self.organization
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// One archived message trace row. The natural key is
/// (tenant_id, message_id, recipient, received_at).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageTrace {
    pub id: i64,
    pub tenant_id: i64,
    pub message_id: String,
    pub received_at: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub status: TraceStatus,
    pub direction: Direction,
    pub size: i64,
    pub event_data: serde_json::Value,
    pub raw_json: serde_json::Value,
    /// Wall-clock time of the pull that created or last refreshed this row.
    pub trace_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullHistory {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub range_start: String,
    pub range_end: String,
    pub records_pulled: i64,
    pub records_new: i64,
    pub records_updated: i64,
    pub status: PullStatus,
    pub error_message: String,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub api_method: String,
}

fn parse_json_value(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
}

fn parse_enum_column<T: FromStr<Err = String>>(raw: String) -> SqlResult<T> {
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

impl Tenant {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            tenant_id: row.get("tenant_id")?,
            client_id: row.get("client_id")?,
            auth_method: parse_enum_column(row.get::<_, String>("auth_method")?)?,
            client_secret: row.get("client_secret")?,
            certificate_path: row.get("certificate_path")?,
            certificate_thumbprint: row.get("certificate_thumbprint")?,
            certificate_password: row.get("certificate_password")?,
            api_method: parse_enum_column(row.get::<_, String>("api_method")?)?,
            organization: row.get("organization")?,
            domains: row.get("domains")?,
            domains_last_updated: row.get("domains_last_updated")?,
            is_active: row.get("is_active")?,
        })
    }
}

impl MessageTrace {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            message_id: row.get("message_id")?,
            received_at: row.get("received_at")?,
            sender: row.get("sender")?,
            recipient: row.get("recipient")?,
            subject: row.get("subject")?,
            status: parse_enum_column(row.get::<_, String>("status")?)?,
            direction: parse_enum_column(row.get::<_, String>("direction")?)?,
            size: row.get("size")?,
            event_data: parse_json_value(row.get("event_data")?),
            raw_json: parse_json_value(row.get("raw_json")?),
            trace_date: row.get("trace_date")?,
        })
    }
}

impl PullHistory {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            range_start: row.get("range_start")?,
            range_end: row.get("range_end")?,
            records_pulled: row.get("records_pulled")?,
            records_new: row.get("records_new")?,
            records_updated: row.get("records_updated")?,
            status: parse_enum_column(row.get::<_, String>("status")?)?,
            error_message: row.get("error_message")?,
            trigger_type: parse_enum_column(row.get::<_, String>("trigger_type")?)?,
            triggered_by: row.get("triggered_by")?,
            api_method: row.get("api_method")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiMethod, AuthMethod, Direction, PullStatus, TraceStatus, TriggerType};

    #[test]
    fn direction_display_and_parse() {
        assert_eq!(Direction::Inbound.to_string(), "Inbound");
        assert_eq!(
            "outbound".parse::<Direction>().expect("parse direction"),
            Direction::Outbound
        );
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn trace_status_round_trips_through_text() {
        for status in [
            TraceStatus::Delivered,
            TraceStatus::Failed,
            TraceStatus::Pending,
            TraceStatus::Expanded,
            TraceStatus::Quarantined,
            TraceStatus::FilteredAsSpam,
            TraceStatus::None,
            TraceStatus::Unknown,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<TraceStatus>().expect("parse status"), status);
        }
    }

    #[test]
    fn method_enums_parse_aliases() {
        assert_eq!(
            "cert".parse::<AuthMethod>().expect("parse auth"),
            AuthMethod::Certificate
        );
        assert_eq!(
            "ps".parse::<ApiMethod>().expect("parse api"),
            ApiMethod::Powershell
        );
    }

    #[test]
    fn pull_enums_display_as_stored_text() {
        assert_eq!(PullStatus::Running.to_string(), "Running");
        assert_eq!(TriggerType::Scheduled.to_string(), "Scheduled");
        assert_eq!(
            "failed".parse::<PullStatus>().expect("parse status"),
            PullStatus::Failed
        );
    }
}
