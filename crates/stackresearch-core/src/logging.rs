//! Append-only JSONL record of completed sessions, with secret redaction and retention.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

const LOG_DIR_ENV: &str = "STACKRESEARCH_LOG_DIR";
const RETENTION_ENV: &str = "STACKRESEARCH_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;
const SESSION_FILE: &str = "session.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "anthropic_key",
            Regex::new(r"(sk-ant-[A-Za-z0-9\-_]{8,})").expect("invalid anthropic_key regex"),
        ),
        (
            "tavily_key",
            Regex::new(r"(tvly-[A-Za-z0-9\-_]{8,})").expect("invalid tavily_key regex"),
        ),
    ]
});

#[derive(Debug, Clone)]
pub struct SessionLogInput {
    pub session_id: String,
    pub project_description: String,
    pub info: String,
    pub satisfactory: bool,
    pub reflection_steps: u8,
    pub missing_components: Vec<String>,
    pub sources: Vec<String>,
    pub trace_path: Option<String>,
}

#[derive(Serialize)]
struct SessionLogRecord {
    timestamp: String,
    session_id: String,
    project_description: String,
    info: String,
    satisfactory: bool,
    reflection_steps: u8,
    missing_components: Vec<String>,
    sources: Vec<String>,
    trace_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    session_id: String,
    redactions: Vec<String>,
}

/// Session log rooted at a directory, laid out as `YYYY/MM/session.jsonl`.
#[derive(Debug, Clone)]
pub struct SessionLog {
    base_dir: PathBuf,
    retention_days: u64,
}

impl SessionLog {
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
        }
    }

    /// `STACKRESEARCH_LOG_DIR` (default `data/logs`) and
    /// `STACKRESEARCH_LOG_RETENTION_DAYS` (default 90, 0 disables pruning).
    pub fn from_env() -> Self {
        let base_dir = std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
        let retention_days = std::env::var(RETENTION_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self::new(base_dir, retention_days)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_completion(&self, input: SessionLogInput) -> Result<PathBuf> {
        let timestamp = Utc::now();
        let mut redactions = BTreeSet::new();

        let project_description = sanitize_text(&input.project_description, &mut redactions);
        let info = sanitize_text(&input.info, &mut redactions);
        let sources: Vec<String> = input
            .sources
            .iter()
            .map(|source| sanitize_text(source, &mut redactions))
            .collect();

        let record = SessionLogRecord {
            timestamp: timestamp.to_rfc3339(),
            session_id: input.session_id.clone(),
            project_description,
            info,
            satisfactory: input.satisfactory,
            reflection_steps: input.reflection_steps,
            missing_components: input.missing_components,
            sources,
            trace_path: input.trace_path,
            redactions: redactions.into_iter().collect(),
        };

        let month_dir = self
            .base_dir
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:02}", timestamp.month()));
        let session_log_path = month_dir.join(SESSION_FILE);
        append_json_line(&session_log_path, &record)?;

        if !record.redactions.is_empty() {
            let audit = AuditLogRecord {
                timestamp: record.timestamp.clone(),
                session_id: input.session_id.clone(),
                redactions: record.redactions.clone(),
            };
            append_json_line(&month_dir.join(AUDIT_FILE), &audit)?;
            warn!(
                session_id = %input.session_id,
                fields = ?record.redactions,
                "redacted potential secrets from session log"
            );
        }

        self.enforce_retention()?;
        Ok(session_log_path)
    }

    /// Drop every record of `session_id`, removing files and directories left empty.
    pub fn remove_session(&self, session_id: &str) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for year_entry in fs::read_dir(&self.base_dir)? {
            let year_entry = year_entry?;
            if !year_entry.file_type()?.is_dir() {
                continue;
            }
            for month_entry in fs::read_dir(year_entry.path())? {
                let month_entry = month_entry?;
                if !month_entry.file_type()?.is_dir() {
                    continue;
                }
                for name in [SESSION_FILE, AUDIT_FILE] {
                    let path = month_entry.path().join(name);
                    removed += rewrite_jsonl_without(&path, session_id)?;
                    remove_if_empty(&path)?;
                }
                remove_dir_if_empty(&month_entry.path())?;
            }
            remove_dir_if_empty(&year_entry.path())?;
        }

        Ok(removed)
    }

    fn enforce_retention(&self) -> Result<()> {
        if self.retention_days == 0 || !self.base_dir.exists() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.retention_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        prune_directory(&self.base_dir, cutoff)
    }
}

/// Remove a session from the log configured by the environment.
pub fn remove_session_logs(session_id: &str) -> Result<usize> {
    SessionLog::from_env().remove_session(session_id)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.to_string());
        }
    }
    output
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            remove_dir_if_empty(&path)?;
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

fn rewrite_jsonl_without(path: &Path, session_id: &str) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }

    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut retained = Vec::new();
    let mut removed = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let matches = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|value| value.get("session_id").and_then(|v| v.as_str()).map(|id| id == session_id))
            .unwrap_or(false);
        if matches {
            removed += 1;
        } else {
            retained.push(line);
        }
    }

    if removed > 0 {
        let file = File::create(path)
            .with_context(|| format!("failed to rewrite log file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for line in retained {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
    }

    Ok(removed)
}

fn remove_if_empty(path: &Path) -> Result<()> {
    if path.exists() && path.metadata()?.len() == 0 {
        fs::remove_file(path).ok();
    }
    Ok(())
}

fn remove_dir_if_empty(path: &Path) -> Result<()> {
    if path.read_dir()?.next().is_none() {
        fs::remove_dir(path).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input(session_id: &str, info: &str) -> SessionLogInput {
        SessionLogInput {
            session_id: session_id.to_string(),
            project_description: "Chat app, api_key=abcd1234".to_string(),
            info: info.to_string(),
            satisfactory: false,
            reflection_steps: 2,
            missing_components: vec!["hosting".to_string()],
            sources: vec!["https://axum.rs".to_string()],
            trace_path: Some("data/traces/test.json".to_string()),
        }
    }

    #[test]
    fn session_logging_sanitizes_and_persists() -> Result<()> {
        let temp = TempDir::new()?;
        let log = SessionLog::new(temp.path(), 0);

        let path = log.log_completion(input("s-1", "token sk-ant-abcdefghijkl"))?;
        let line = std::fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["session_id"], "s-1");
        assert_eq!(record["reflection_steps"], 2);
        assert_eq!(record["project_description"], "Chat app, api_key=[REDACTED]");
        assert_eq!(record["info"], "token [REDACTED]");
        assert_eq!(record["redactions"], serde_json::json!(["anthropic_key", "api_key"]));

        let audit = path.with_file_name(AUDIT_FILE);
        assert!(audit.exists());
        Ok(())
    }

    #[test]
    fn remove_session_keeps_other_sessions() -> Result<()> {
        let temp = TempDir::new()?;
        let log = SessionLog::new(temp.path(), 0);
        let path = log.log_completion(input("keep", "{}"))?;
        log.log_completion(input("drop", "{}"))?;

        let removed = log.remove_session("drop")?;
        assert_eq!(removed, 2, "session and audit lines");

        let contents = std::fs::read_to_string(&path)?;
        assert!(contents.contains("\"keep\""));
        assert!(!contents.contains("\"drop\""));

        assert_eq!(log.remove_session("keep")?, 2);
        assert!(temp.path().read_dir()?.next().is_none());
        Ok(())
    }
}
