// Compliance audit trail
//
// One record per gateway call. Identifiers are masked before a record
// exists, and every record is chained to its predecessor by SHA-256 so
// edits, deletions and reordering show up in `verify_chain`.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::config::{AuditConfig, AuditSinkKind};
use crate::error::{AppError, AppResult};
use crate::models::{AuditCategory, AuditOutcome, AuditQuery, AuditRecord};
use crate::modules::db;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const VISIBLE_TAIL: usize = 4;

static DIGIT_RUN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\d{6,}").ok());

/// Keep only the last four characters: `9434765870` -> `******5870`
pub fn mask_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    let visible = if chars.len() > VISIBLE_TAIL {
        VISIBLE_TAIL
    } else {
        0
    };
    let hidden = chars.len() - visible;
    std::iter::repeat('*')
        .take(hidden)
        .chain(chars[hidden..].iter().copied())
        .collect()
}

/// Mask every run of six or more digits inside free text
pub fn mask_text(text: &str) -> String {
    match DIGIT_RUN.as_ref() {
        Some(re) => re
            .replace_all(text, |caps: &Captures| mask_identifier(&caps[0]))
            .into_owned(),
        // Without the pattern nothing can be proven clean
        None => mask_identifier(text),
    }
}

/// Recursively mask string values of a context document
pub fn mask_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(mask_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, mask_value(v)))
                .collect::<Map<String, Value>>(),
        ),
        // Bare numbers can carry identifiers too
        Value::Number(n) if n.to_string().len() >= 6 && n.is_u64() => {
            Value::String(mask_identifier(&n.to_string()))
        }
        other => other,
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Hash of a record body linked to `prev_hash`
pub fn compute_hash(record: &AuditRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"health_gateway_audit_v1:");
    hasher.update(record.prev_hash.as_bytes());
    hasher.update(b"|");
    let fields = [
        record.id.to_string(),
        record.request_id.clone(),
        format_timestamp(&record.timestamp),
        record.action.clone(),
        record.category.as_str().to_string(),
        record.channel.clone(),
        record.masked_subject_id.clone().unwrap_or_default(),
        record.outcome.as_str().to_string(),
        record.attempts.to_string(),
        record.cache_hit.to_string(),
        record.duration_ms.to_string(),
        record.tenant_id.clone().unwrap_or_default(),
        record.actor.clone().unwrap_or_default(),
        record.context.to_string(),
    ];
    for field in &fields {
        hasher.update(field.len().to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Check an ordered, complete log starting at the genesis record
pub fn verify_chain(records: &[AuditRecord]) -> AppResult<()> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        if record.prev_hash != expected_prev {
            return Err(AppError::Audit(format!(
                "Audit chain broken at record {} ({}): predecessor mismatch",
                index, record.id
            )));
        }
        if compute_hash(record) != record.hash {
            return Err(AppError::Audit(format!(
                "Audit chain broken at record {} ({}): content altered",
                index, record.id
            )));
        }
        expected_prev = record.hash.clone();
    }
    Ok(())
}

/// Trim an oldest-first list to its last `limit` entries
fn keep_newest(mut records: Vec<AuditRecord>, limit: Option<usize>) -> Vec<AuditRecord> {
    if let Some(limit) = limit {
        let excess = records.len().saturating_sub(limit);
        records.drain(..excess);
    }
    records
}

/// Where audit records end up
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> AppResult<()>;

    /// Records matching `query`, oldest first; `limit` keeps the newest
    fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditRecord>>;

    /// Hash of the newest record, if any
    fn last_hash(&self) -> AppResult<Option<String>>;
}

/// In-memory sink for tests and throwaway runs
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: &AuditRecord) -> AppResult<()> {
        self.records
            .lock()
            .map_err(|_| AppError::Audit("memory sink poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| AppError::Audit("memory sink poisoned".to_string()))?;
        let matching = records.iter().filter(|r| query.matches(r)).cloned().collect();
        Ok(keep_newest(matching, query.limit))
    }

    fn last_hash(&self) -> AppResult<Option<String>> {
        let records = self
            .records
            .lock()
            .map_err(|_| AppError::Audit("memory sink poisoned".to_string()))?;
        Ok(records.last().map(|r| r.hash.clone()))
    }
}

/// One JSON document per line, opened in append mode for every write
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Create eagerly so permission problems surface at startup
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> AppResult<Vec<AuditRecord>> {
        let file = std::fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: &AuditRecord) -> AppResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::Audit("jsonl sink poisoned".to_string()))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditRecord>> {
        let matching = self
            .read_all()?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        Ok(keep_newest(matching, query.limit))
    }

    fn last_hash(&self) -> AppResult<Option<String>> {
        Ok(self.read_all()?.last().map(|r| r.hash.clone()))
    }
}

/// Default sink: `audit_log` table guarded by append-only triggers
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = db::open_connection(path)?;
        db::init_audit_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Audit("audit connection poisoned".to_string()))
    }
}

struct RawRecord {
    id: String,
    request_id: String,
    timestamp: String,
    action: String,
    category: String,
    channel: String,
    masked_subject_id: Option<String>,
    outcome: String,
    attempts: u32,
    cache_hit: bool,
    duration_ms: i64,
    tenant_id: Option<String>,
    actor: Option<String>,
    context: String,
    prev_hash: String,
    hash: String,
}

impl RawRecord {
    fn into_record(self) -> AppResult<AuditRecord> {
        Ok(AuditRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| AppError::Audit(format!("Invalid record id: {}", e)))?,
            request_id: self.request_id,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map_err(|e| AppError::Audit(format!("Invalid timestamp: {}", e)))?
                .with_timezone(&Utc),
            action: self.action,
            category: self.category.parse()?,
            channel: self.channel,
            masked_subject_id: self.masked_subject_id,
            outcome: self.outcome.parse()?,
            attempts: self.attempts,
            cache_hit: self.cache_hit,
            duration_ms: self.duration_ms.max(0) as u64,
            tenant_id: self.tenant_id,
            actor: self.actor,
            context: serde_json::from_str(&self.context)?,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}

impl AuditSink for SqliteAuditSink {
    fn append(&self, record: &AuditRecord) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (id, request_id, timestamp, action, category, channel,
                masked_subject_id, outcome, attempts, cache_hit, duration_ms, tenant_id,
                actor, context, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id.to_string(),
                record.request_id,
                format_timestamp(&record.timestamp),
                record.action,
                record.category.as_str(),
                record.channel,
                record.masked_subject_id,
                record.outcome.as_str(),
                record.attempts,
                record.cache_hit,
                record.duration_ms as i64,
                record.tenant_id,
                record.actor,
                record.context.to_string(),
                record.prev_hash,
                record.hash,
            ],
        )?;
        Ok(())
    }

    fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditRecord>> {
        let mut sql = String::from(
            "SELECT id, request_id, timestamp, action, category, channel, masked_subject_id,
                    outcome, attempts, cache_hit, duration_ms, tenant_id, actor, context,
                    prev_hash, hash
             FROM audit_log WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(category) = query.category {
            sql.push_str(" AND category = ?");
            args.push(category.as_str().to_string());
        }
        if let Some(from) = &query.from {
            sql.push_str(" AND timestamp >= ?");
            args.push(format_timestamp(from));
        }
        if let Some(to) = &query.to {
            sql.push_str(" AND timestamp <= ?");
            args.push(format_timestamp(to));
        }
        // Newest first so LIMIT keeps the latest; flipped back below
        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(RawRecord {
                id: row.get(0)?,
                request_id: row.get(1)?,
                timestamp: row.get(2)?,
                action: row.get(3)?,
                category: row.get(4)?,
                channel: row.get(5)?,
                masked_subject_id: row.get(6)?,
                outcome: row.get(7)?,
                attempts: row.get(8)?,
                cache_hit: row.get(9)?,
                duration_ms: row.get(10)?,
                tenant_id: row.get(11)?,
                actor: row.get(12)?,
                context: row.get(13)?,
                prev_hash: row.get(14)?,
                hash: row.get(15)?,
            })
        })?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        records.reverse();
        Ok(records)
    }

    fn last_hash(&self) -> AppResult<Option<String>> {
        let conn = self.conn()?;
        let hash = conn
            .query_row(
                "SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }
}

/// Build the configured sink; relative or missing paths land in `data_dir`
pub fn open_audit_sink(config: &AuditConfig, data_dir: &Path) -> AppResult<Arc<dyn AuditSink>> {
    let resolve = |default_name: &str| -> PathBuf {
        match &config.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join(default_name),
        }
    };

    let sink: Arc<dyn AuditSink> = match config.sink {
        AuditSinkKind::Sqlite => Arc::new(SqliteAuditSink::open(&resolve("audit.db"))?),
        AuditSinkKind::Jsonl => Arc::new(JsonlAuditSink::open(resolve("audit.jsonl"))?),
        AuditSinkKind::Memory => {
            tracing::warn!("Audit records are kept in memory only and vanish on exit");
            Arc::new(MemoryAuditSink::new())
        }
    };
    Ok(sink)
}

/// Everything known about a call besides its action and category
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub request_id: String,
    pub channel: String,
    pub subject_id: Option<String>,
    pub outcome: AuditOutcome,
    pub attempts: u32,
    pub cache_hit: bool,
    pub duration: Duration,
    pub tenant_id: Option<String>,
    pub actor: Option<String>,
    pub details: Value,
}

impl AuditContext {
    pub fn new(request_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            channel: channel.into(),
            subject_id: None,
            outcome: AuditOutcome::Success,
            attempts: 0,
            cache_hit: false,
            duration: Duration::ZERO,
            tenant_id: None,
            actor: None,
            details: Value::Object(Map::new()),
        }
    }

    pub fn subject(mut self, subject_id: Option<&str>) -> Self {
        self.subject_id = subject_id.map(str::to_string);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Add one free-form detail; masked before persistence
    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    /// Hash of the last persisted record; appends are serialized on it
    head: Mutex<String>,
}

impl AuditRecorder {
    /// Resume the chain from whatever the sink already holds
    pub fn new(sink: Arc<dyn AuditSink>) -> AppResult<Self> {
        let head = sink
            .last_hash()?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        Ok(Self {
            sink,
            head: Mutex::new(head),
        })
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Mask, chain and persist one record.
    ///
    /// Returns the stored record, or None when the sink refused it. Failures
    /// are reported through the error log only.
    pub fn log_action(
        &self,
        action: &str,
        category: AuditCategory,
        ctx: AuditContext,
    ) -> Option<AuditRecord> {
        let mut head = match self.head.lock() {
            Ok(head) => head,
            Err(_) => {
                tracing::error!(
                    "[{}] Audit chain lock poisoned, record for {} dropped",
                    ctx.request_id,
                    action
                );
                return None;
            }
        };

        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            timestamp: Utc::now(),
            action: action.to_string(),
            category,
            channel: ctx.channel,
            masked_subject_id: ctx.subject_id.as_deref().map(mask_identifier),
            outcome: ctx.outcome,
            attempts: ctx.attempts,
            cache_hit: ctx.cache_hit,
            duration_ms: ctx.duration.as_millis() as u64,
            tenant_id: ctx.tenant_id,
            actor: ctx.actor,
            context: mask_value(ctx.details),
            prev_hash: head.clone(),
            hash: String::new(),
        };
        record.hash = compute_hash(&record);

        match self.sink.append(&record) {
            Ok(()) => {
                *head = record.hash.clone();
                tracing::debug!(
                    "[{}] Audit {} {} -> {}",
                    record.request_id,
                    record.action,
                    record.category.as_str(),
                    record.outcome.as_str()
                );
                Some(record)
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Failed to persist audit record for {}: {}",
                    record.request_id,
                    record.action,
                    e
                );
                None
            }
        }
    }

    pub fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditRecord>> {
        self.sink.query(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn append(&self, _record: &AuditRecord) -> AppResult<()> {
            Err(AppError::Audit("disk full".to_string()))
        }
        fn query(&self, _query: &AuditQuery) -> AppResult<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
        fn last_hash(&self) -> AppResult<Option<String>> {
            Ok(None)
        }
    }

    fn ctx(request_id: &str) -> AuditContext {
        AuditContext::new(request_id, "demographics")
            .subject(Some("9434765870"))
            .attempts(1)
            .duration(Duration::from_millis(12))
    }

    #[test]
    fn test_mask_identifier() {
        assert_eq!(mask_identifier("9434765870"), "******5870");
        assert_eq!(mask_identifier("1234"), "****");
        assert_eq!(mask_identifier(""), "");
    }

    #[test]
    fn test_mask_value_scrubs_nested_digit_runs() {
        let masked = mask_value(json!({
            "note": "lookup for 9434765870 by desk 12",
            "refs": ["9434765870", {"deep": "nhs:9434765870"}],
            "raw": 9434765870u64,
            "small": 42
        }));
        let text = masked.to_string();
        assert!(!text.contains("9434765870"));
        assert_eq!(masked["note"], "lookup for ******5870 by desk 12");
        assert_eq!(masked["refs"][1]["deep"], "nhs:******5870");
        assert_eq!(masked["raw"], "******5870");
        assert_eq!(masked["small"], 42);
    }

    #[test]
    fn test_recorder_masks_and_chains() {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone()).unwrap();

        let first = recorder
            .log_action(
                "patient.read",
                AuditCategory::Demographics,
                ctx("r1").detail("query", "patient 9434765870"),
            )
            .unwrap();
        recorder
            .log_action("patient.read", AuditCategory::Demographics, ctx("r2"))
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(first.masked_subject_id.as_deref(), Some("******5870"));
        assert!(!serde_json::to_string(&records).unwrap().contains("9434765870"));
        verify_chain(&records).unwrap();
    }

    #[test]
    fn test_verify_chain_detects_tampering() {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone()).unwrap();
        for id in ["r1", "r2", "r3"] {
            recorder.log_action("patient.read", AuditCategory::Demographics, ctx(id));
        }
        let records = sink.records();

        let mut edited = records.clone();
        edited[1].outcome = AuditOutcome::NotFound;
        assert!(verify_chain(&edited).is_err());

        let mut deleted = records.clone();
        deleted.remove(1);
        assert!(verify_chain(&deleted).is_err());

        let mut reordered = records.clone();
        reordered.swap(0, 2);
        assert!(verify_chain(&reordered).is_err());
    }

    #[test]
    fn test_failing_sink_does_not_advance_chain() {
        let recorder = AuditRecorder::new(Arc::new(BrokenSink)).unwrap();
        assert!(recorder
            .log_action("patient.read", AuditCategory::Demographics, ctx("r1"))
            .is_none());
        assert_eq!(*recorder.head.lock().unwrap(), GENESIS_HASH);
    }

    #[test]
    fn test_sqlite_sink_round_trip_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        {
            let recorder = AuditRecorder::new(Arc::new(SqliteAuditSink::open(&path).unwrap())).unwrap();
            recorder.log_action("patient.read", AuditCategory::Demographics, ctx("r1"));
            recorder.log_action(
                "prescription.search",
                AuditCategory::Prescriptions,
                AuditContext::new("r2", "prescriptions").outcome(AuditOutcome::NotFound),
            );
        }

        // A restarted recorder continues the same chain
        let sink = Arc::new(SqliteAuditSink::open(&path).unwrap());
        let recorder = AuditRecorder::new(sink.clone()).unwrap();
        recorder.log_action("patient.read", AuditCategory::Demographics, ctx("r3"));

        let all = sink.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        verify_chain(&all).unwrap();

        let demographics = sink
            .query(&AuditQuery {
                category: Some(AuditCategory::Demographics),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(demographics.len(), 2);

        let future = sink
            .query(&AuditQuery {
                from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlAuditSink::open(dir.path().join("logs/audit.jsonl")).unwrap());
        let recorder = AuditRecorder::new(sink.clone()).unwrap();
        recorder.log_action("exemption.check", AuditCategory::Exemptions, ctx("r1"));
        recorder.log_action("exemption.check", AuditCategory::Exemptions, ctx("r2"));

        let content = std::fs::read_to_string(dir.path().join("logs/audit.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("9434765870"));

        let records = sink
            .query(&AuditQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, "r2");
        assert_eq!(sink.last_hash().unwrap(), Some(sink.query(&AuditQuery::default()).unwrap()[1].hash.clone()));
        verify_chain(&sink.query(&AuditQuery::default()).unwrap()).unwrap();
    }

    #[test]
    fn test_limit_keeps_newest_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sinks: Vec<Arc<dyn AuditSink>> = vec![
            Arc::new(MemoryAuditSink::new()),
            Arc::new(SqliteAuditSink::open(&dir.path().join("audit.db")).unwrap()),
        ];

        for sink in sinks {
            let recorder = AuditRecorder::new(sink.clone()).unwrap();
            for id in ["r1", "r2", "r3", "r4"] {
                recorder.log_action("patient.read", AuditCategory::Demographics, ctx(id));
            }

            let latest = sink
                .query(&AuditQuery {
                    limit: Some(2),
                    ..Default::default()
                })
                .unwrap();
            let ids: Vec<&str> = latest.iter().map(|r| r.request_id.as_str()).collect();
            assert_eq!(ids, vec!["r3", "r4"]);
            assert_eq!(latest[1].prev_hash, latest[0].hash);

            let all = sink.query(&AuditQuery::default()).unwrap();
            assert_eq!(all.len(), 4);
            verify_chain(&all).unwrap();
        }
    }
}
