use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::db::models::Tenant;
use crate::db::{Database, TraceRecord};
use crate::normalize::{canonical_status, NormalizedTrace};

/// Rows written per transaction while reconciling a pull.
pub const RECONCILE_BATCH_SIZE: usize = 100;

/// Rows re-examined per transaction when recomputing directions.
pub const DIRECTION_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
}

/// Merges a batch of normalized traces into the archive.
///
/// Each record is timestamped, classified, and upserted on the natural key
/// (tenant, message_id, recipient, received_at). Unparseable timestamps skip
/// the record with a warning; they never fail the batch. Writes are flushed
/// in transactions of `RECONCILE_BATCH_SIZE`.
pub fn reconcile(
    db: &Database,
    tenant: &Tenant,
    traces: &[NormalizedTrace],
    internal_domains: &[String],
    trace_date: &str,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    let mut inserts: Vec<TraceRecord> = Vec::new();
    let mut updates: Vec<TraceRecord> = Vec::new();

    for trace in traces {
        if trace.message_id.is_empty() {
            warn!(tenant = %tenant.name, "skipping trace without a message id");
            outcome.skipped += 1;
            continue;
        }

        let Some(received) = parse_received(&trace.received) else {
            warn!(
                tenant = %tenant.name,
                message_id = %trace.message_id,
                received = %trace.received,
                "skipping trace with unparseable received timestamp"
            );
            outcome.skipped += 1;
            continue;
        };

        let record = TraceRecord {
            tenant_id: tenant.id,
            message_id: trace.message_id.clone(),
            received_at: canonical_timestamp(received),
            sender: trace.sender.clone(),
            recipient: trace.recipient.clone(),
            subject: trace.subject.clone(),
            status: canonical_status(&trace.status),
            direction: classify(&trace.sender, &trace.recipient, internal_domains),
            size: trace.size,
            event_data: trace.event_data.clone(),
            raw_json: trace.raw.clone(),
            trace_date: trace_date.to_string(),
        };

        let exists = db.trace_exists(
            record.tenant_id,
            &record.message_id,
            &record.recipient,
            &record.received_at,
        )?;
        if exists {
            updates.push(record);
        } else {
            inserts.push(record);
        }

        if inserts.len() >= RECONCILE_BATCH_SIZE {
            outcome.new += flush_inserts(db, &mut inserts)?;
        }
        if updates.len() >= RECONCILE_BATCH_SIZE {
            outcome.updated += flush_updates(db, &mut updates)?;
        }
    }

    outcome.new += flush_inserts(db, &mut inserts)?;
    outcome.updated += flush_updates(db, &mut updates)?;

    debug!(
        tenant = %tenant.name,
        new = outcome.new,
        updated = outcome.updated,
        skipped = outcome.skipped,
        "reconciled trace batch"
    );
    Ok(outcome)
}

fn flush_inserts(db: &Database, queue: &mut Vec<TraceRecord>) -> Result<u64> {
    if queue.is_empty() {
        return Ok(0);
    }

    // The natural-key conflict clause absorbs a concurrent pull inserting the
    // same tuple; the count still reports the queued records as new.
    let count = queue.len() as u64;
    let tx = db.conn().unchecked_transaction()?;
    for record in queue.drain(..) {
        db.insert_trace(&record)
            .with_context(|| format!("insert trace {}", record.message_id))?;
    }
    tx.commit()?;
    Ok(count)
}

fn flush_updates(db: &Database, queue: &mut Vec<TraceRecord>) -> Result<u64> {
    if queue.is_empty() {
        return Ok(0);
    }

    let count = queue.len() as u64;
    let tx = db.conn().unchecked_transaction()?;
    for record in queue.drain(..) {
        db.update_trace(&record)
            .with_context(|| format!("update trace {}", record.message_id))?;
    }
    tx.commit()?;
    Ok(count)
}

/// Accepts the timestamp shapes the two backends emit: RFC 3339, a naive ISO
/// datetime assumed UTC (space or T separator), or the .NET `/Date(ms)/`
/// wire form.
pub fn parse_received(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Some(millis) = raw
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
        .and_then(|digits| digits.parse::<i64>().ok())
    {
        return DateTime::from_timestamp_millis(millis);
    }

    None
}

/// Canonical stored form: RFC 3339 UTC at microsecond precision, so the same
/// instant from either backend maps onto one natural key.
pub fn canonical_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectionFixOutcome {
    pub examined: u64,
    pub changed: u64,
    /// Changed-row counts keyed by the new direction text.
    pub by_direction: BTreeMap<String, u64>,
}

/// Re-derives the direction of every archived trace for a tenant from the
/// given domain list, updating rows whose stored direction disagrees.
pub fn recompute_directions(
    db: &Database,
    tenant: &Tenant,
    internal_domains: &[String],
    batch_size: usize,
    dry_run: bool,
) -> Result<DirectionFixOutcome> {
    let batch_size = if batch_size == 0 {
        DIRECTION_BATCH_SIZE
    } else {
        batch_size
    };

    let mut outcome = DirectionFixOutcome::default();
    let mut after_id = 0i64;

    loop {
        let page = db.traces_page(tenant.id, after_id, batch_size)?;
        if page.is_empty() {
            break;
        }

        let tx = db.conn().unchecked_transaction()?;
        for trace in &page {
            outcome.examined += 1;
            after_id = trace.id;

            let direction = classify(&trace.sender, &trace.recipient, internal_domains);
            if direction == trace.direction {
                continue;
            }

            outcome.changed += 1;
            *outcome.by_direction.entry(direction.to_string()).or_default() += 1;
            if !dry_run {
                db.set_trace_direction(trace.id, direction)?;
            }
        }
        tx.commit()?;
    }

    info!(
        tenant = %tenant.name,
        examined = outcome.examined,
        changed = outcome.changed,
        dry_run,
        "direction recompute finished"
    );
    Ok(outcome)
}
