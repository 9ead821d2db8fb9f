use serde_json::{json, Map, Value};

use crate::db::models::TraceStatus;

/// Which transport produced a raw trace record. The two backends use
/// different field names for the same data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Graph,
    Powershell,
}

/// A raw trace straightened into one field shape, before timestamp parsing
/// and direction classification. Missing fields default to "" / 0 / {}.
#[derive(Debug, Clone)]
pub struct NormalizedTrace {
    pub message_id: String,
    /// Received timestamp exactly as the source sent it.
    pub received: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    /// Vendor status string; map through `canonical_status` before storing.
    pub status: String,
    pub size: i64,
    pub event_data: Value,
    pub raw: Value,
}

pub fn normalize(raw: &Value, source: SourceKind) -> NormalizedTrace {
    match source {
        SourceKind::Graph => normalize_graph(raw),
        SourceKind::Powershell => normalize_powershell(raw),
    }
}

/// Maps vendor delivery-status vocabulary onto the stored set. GettingStatus
/// is a transient probe state and lands as Pending; anything unrecognized is
/// Unknown rather than an error.
pub fn canonical_status(raw: &str) -> TraceStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "delivered" => TraceStatus::Delivered,
        "failed" => TraceStatus::Failed,
        "pending" | "gettingstatus" => TraceStatus::Pending,
        "expanded" => TraceStatus::Expanded,
        "quarantined" => TraceStatus::Quarantined,
        "filteredasspam" => TraceStatus::FilteredAsSpam,
        "none" | "" => TraceStatus::None,
        _ => TraceStatus::Unknown,
    }
}

fn normalize_graph(raw: &Value) -> NormalizedTrace {
    let message_id = str_field(raw, "messageId")
        .or_else(|| str_field(raw, "internetMessageId"))
        .unwrap_or_default();
    let received = str_field(raw, "receivedDateTime")
        .or_else(|| str_field(raw, "received"))
        .unwrap_or_default();
    let sender = raw
        .pointer("/sender/emailAddress/address")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| str_field(raw, "senderAddress"))
        .unwrap_or_default();
    let recipient = str_field(raw, "recipientAddress").unwrap_or_default();

    NormalizedTrace {
        message_id,
        received,
        sender,
        recipient,
        subject: str_field(raw, "subject").unwrap_or_default(),
        status: str_field(raw, "status").unwrap_or_default(),
        size: raw.get("size").and_then(Value::as_i64).unwrap_or(0),
        event_data: raw.get("eventData").cloned().unwrap_or_else(|| json!({})),
        raw: raw.clone(),
    }
}

fn normalize_powershell(raw: &Value) -> NormalizedTrace {
    let mut event_data = Map::new();
    for (source_key, target_key) in [
        ("FromIP", "from_ip"),
        ("ToIP", "to_ip"),
        ("MessageTraceId", "message_trace_id"),
    ] {
        if let Some(value) = raw.get(source_key).filter(|v| !v.is_null()) {
            event_data.insert(target_key.to_string(), value.clone());
        }
    }

    NormalizedTrace {
        message_id: str_field(raw, "MessageId").unwrap_or_default(),
        received: str_field(raw, "Received").unwrap_or_default(),
        sender: str_field(raw, "SenderAddress").unwrap_or_default(),
        recipient: str_field(raw, "RecipientAddress").unwrap_or_default(),
        subject: str_field(raw, "Subject").unwrap_or_default(),
        status: str_field(raw, "Status").unwrap_or_default(),
        size: raw.get("Size").and_then(Value::as_i64).unwrap_or(0),
        event_data: Value::Object(event_data),
        raw: raw.clone(),
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}
