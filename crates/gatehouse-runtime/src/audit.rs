//! Append-only SQLite log of every completed tool-call decision.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Approved,
    Rejected,
    Timeout,
    Passthrough,
    Blocked,
    Error,
}

impl AuditDecision {
    pub const ALL: [AuditDecision; 6] = [
        AuditDecision::Approved,
        AuditDecision::Rejected,
        AuditDecision::Timeout,
        AuditDecision::Passthrough,
        AuditDecision::Blocked,
        AuditDecision::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditDecision::Approved => "approved",
            AuditDecision::Rejected => "rejected",
            AuditDecision::Timeout => "timeout",
            AuditDecision::Passthrough => "passthrough",
            AuditDecision::Blocked => "blocked",
            AuditDecision::Error => "error",
        }
    }
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AuditDecision::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown audit decision: {:?}", s))
    }
}

/// A decision about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub agent: Option<String>,
    pub service_id: String,
    pub tool_name: String,
    /// Arguments as forwarded upstream, serialized as JSON
    pub params: Option<String>,
    pub reason: Option<String>,
    pub content: Option<String>,
    pub decision: AuditDecision,
    pub decided_by: String,
    pub latency_ms: Option<u64>,
}

/// A stored row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: String,
    pub agent: Option<String>,
    pub mcp: String,
    pub tool: String,
    pub params: Option<String>,
    pub reason: Option<String>,
    pub content: Option<String>,
    pub decision: String,
    pub decided_by: String,
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tool: Option<String>,
    pub service_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub decision: Option<AuditDecision>,
    pub limit: Option<usize>,
}

/// Write side of the audit log, as used by the dispatcher
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), ProxyError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    agent TEXT,
    mcp TEXT NOT NULL,
    tool TEXT NOT NULL,
    params TEXT,
    reason TEXT,
    content TEXT,
    decision TEXT NOT NULL,
    decided_by TEXT NOT NULL,
    latency_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_mcp_tool ON audit_log(mcp, tool);
CREATE INDEX IF NOT EXISTS idx_audit_decision ON audit_log(decision);
";

const COLUMNS: &str =
    "id, timestamp, agent, mcp, tool, params, reason, content, decision, decided_by, latency_ms";

/// RFC 3339 UTC with milliseconds, so string order is time order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite-backed audit log
pub struct AuditStore {
    conn: Mutex<Option<Connection>>,
}

impl AuditStore {
    /// Open or create the database, creating parent directories
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create audit directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open audit database {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::init(conn)?;
        info!(path = %db_path.display(), "Audit store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory audit db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize audit schema")?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| anyhow!("Audit DB lock poisoned: {}", e))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => bail!("Audit store is closed"),
        }
    }

    /// Append a row stamped with the current time
    pub fn append(&self, entry: &AuditEntry) -> Result<i64> {
        self.append_at(entry, Utc::now())
    }

    /// Append a row with an explicit timestamp
    pub fn append_at(&self, entry: &AuditEntry, at: DateTime<Utc>) -> Result<i64> {
        let latency = entry.latency_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (timestamp, agent, mcp, tool, params, reason, content, decision, decided_by, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    format_timestamp(at),
                    entry.agent,
                    entry.service_id,
                    entry.tool_name,
                    entry.params,
                    entry.reason,
                    entry.content,
                    entry.decision.as_str(),
                    entry.decided_by,
                    latency,
                ],
            )
            .context("Failed to insert audit record")?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Matching rows, newest first
    pub fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(tool) = &filter.tool {
            clauses.push("tool = ?");
            values.push(SqlValue::Text(tool.clone()));
        }
        if let Some(service) = &filter.service_id {
            clauses.push("mcp = ?");
            values.push(SqlValue::Text(service.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("timestamp >= ?");
            values.push(SqlValue::Text(format_timestamp(since)));
        }
        if let Some(decision) = filter.decision {
            clauses.push("decision = ?");
            values.push(SqlValue::Text(decision.as_str().to_string()));
        }

        let mut sql = format!("SELECT {} FROM audit_log", COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read audit records")?;
            Ok(rows)
        })
    }

    /// Every row, newest first
    pub fn export_all(&self) -> Result<Vec<AuditRecord>> {
        self.query(&AuditQuery::default())
    }

    /// Delete rows older than `retention_days`, returning how many went
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = chrono::Duration::try_days(i64::from(retention_days))
            .and_then(|span| Utc::now().checked_sub_signed(span));
        // Cutoff before the earliest representable date: nothing can be older
        let Some(cutoff) = cutoff else {
            debug!(retention_days, "Retention window exceeds date range, nothing to prune");
            return Ok(0);
        };
        let deleted = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM audit_log WHERE timestamp < ?1",
                params![format_timestamp(cutoff)],
            )
            .context("Failed to prune audit records")
        })?;
        info!(deleted, retention_days, "Audit retention cleanup finished");
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
    }

    /// Release the database handle. Later writes fail. Idempotent.
    pub fn close(&self) {
        let conn = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                debug!(error = %e, "Audit database close reported an error");
            }
            info!("Audit store closed");
        }
    }
}

impl AuditSink for AuditStore {
    fn record(&self, entry: &AuditEntry) -> Result<(), ProxyError> {
        self.append(entry)
            .map(|_| ())
            .map_err(|e| ProxyError::AuditWriteFailed(format!("{:#}", e)))
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        agent: row.get(2)?,
        mcp: row.get(3)?,
        tool: row.get(4)?,
        params: row.get(5)?,
        reason: row.get(6)?,
        content: row.get(7)?,
        decision: row.get(8)?,
        decided_by: row.get(9)?,
        latency_ms: row.get(10)?,
    })
}
