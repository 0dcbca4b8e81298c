use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use gatehouse_runtime::{AuditDecision, AuditQuery, AuditRecord, AuditStore, ProxyConfig};
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::cli::ExportFormat;

static SINCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d)$").expect("invalid regex"));

const CSV_HEADERS: [&str; 11] = [
    "id",
    "timestamp",
    "agent",
    "mcp",
    "tool",
    "params",
    "reason",
    "content",
    "decision",
    "decided_by",
    "latency_ms",
];

pub struct ListOptions {
    pub tool: Option<String>,
    pub mcp: Option<String>,
    pub last: u32,
    pub since: Option<String>,
    pub decision: Option<String>,
}

fn open_store(config: &ProxyConfig) -> Result<AuditStore> {
    AuditStore::open(Path::new(&config.audit.db_path))
        .with_context(|| format!("Failed to open audit log at {}", config.audit.db_path))
}

/// `500ms`, `30s`, `30m`, `12h` or `7d` before `now`
pub fn parse_since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let caps = SINCE.captures(input).ok_or_else(|| {
        anyhow!(
            "Invalid --since value {:?} (expected e.g. \"30s\", \"30m\", \"1h\", \"7d\")",
            input
        )
    })?;
    let value: i64 = caps[1]
        .parse()
        .with_context(|| format!("Invalid --since value {:?}", input))?;
    let span = match &caps[2] {
        "ms" => Duration::try_milliseconds(value),
        "s" => Duration::try_seconds(value),
        "m" => Duration::try_minutes(value),
        "h" => Duration::try_hours(value),
        _ => Duration::try_days(value),
    }
    .ok_or_else(|| anyhow!("--since value out of range: {:?}", input))?;
    Ok(now - span)
}

pub fn build_query(opts: &ListOptions, now: DateTime<Utc>) -> Result<AuditQuery> {
    Ok(AuditQuery {
        tool: opts.tool.clone(),
        service_id: opts.mcp.clone(),
        since: opts.since.as_deref().map(|s| parse_since(s, now)).transpose()?,
        decision: opts
            .decision
            .as_deref()
            .map(str::parse::<AuditDecision>)
            .transpose()?,
        limit: Some(opts.last as usize),
    })
}

pub fn list(config: &ProxyConfig, opts: &ListOptions) -> Result<()> {
    let query = build_query(opts, Utc::now())?;
    let store = open_store(config)?;
    let records = store.query(&query);
    store.close();
    print!("{}", render_list(&records?));
    Ok(())
}

fn decision_icon(decision: &str) -> &'static str {
    match decision {
        "approved" => "✅",
        "rejected" => "❌",
        "timeout" => "⏱",
        "blocked" => "🚫",
        "error" => "⚠️",
        _ => "➡️",
    }
}

pub fn render_list(records: &[AuditRecord]) -> String {
    if records.is_empty() {
        return "No audit records found\n".to_string();
    }
    let mut out = format!("\n📋 Audit Log ({} entries):\n\n", records.len());
    for r in records {
        let latency = r
            .latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{} [{}] {}.{} → {} ({}, {})",
            decision_icon(&r.decision),
            r.timestamp,
            r.mcp,
            r.tool,
            r.decision,
            r.decided_by,
            latency
        );
        if let Some(agent) = &r.agent {
            let _ = writeln!(out, "   Agent: {}", agent);
        }
        if let Some(reason) = &r.reason {
            let _ = writeln!(out, "   Reason: {}", reason);
        }
    }
    out
}

pub fn export(config: &ProxyConfig, format: ExportFormat, output: Option<&PathBuf>) -> Result<()> {
    let store = open_store(config)?;
    let records = store.export_all();
    store.close();
    let records = records?;

    let rendered = match format {
        ExportFormat::Csv => to_csv(&records)?,
        ExportFormat::Json => serde_json::to_string_pretty(&records)?,
    };

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Exported {} records to {}", records.len(), path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

/// Fields with a comma, quote, CR or LF are quoted
pub fn to_csv(records: &[AuditRecord]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;
    for r in records {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        writer.write_record([
            r.id.to_string(),
            r.timestamp.clone(),
            opt(&r.agent),
            r.mcp.clone(),
            r.tool.clone(),
            opt(&r.params),
            opt(&r.reason),
            opt(&r.content),
            r.decision.clone(),
            r.decided_by.clone(),
            r.latency_ms.map(|ms| ms.to_string()).unwrap_or_default(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV: {}", e.error()))?;
    let text = String::from_utf8(bytes).context("CSV output was not UTF-8")?;
    Ok(text.trim_end_matches('\n').to_string())
}
