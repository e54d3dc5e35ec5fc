use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    // [2025-12-02 22:12:52] [info] [gin_logger.go:58] message
    static ref BRACKETED: Regex =
        Regex::new(r"^\[([^\]]*)\]\s*\[([^\]]*)\]\s*(?:\[[^\]]*\]\s*)?(.*)$").unwrap();
    // 2024-01-15T10:30:45.123Z [INFO] message
    static ref ISO_PREFIXED: Regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2}[T ][^\s\[]+)\s*\[([^\]]*)\]\s*(.*)$").unwrap();
    // WARN: message
    static ref LEVEL_PREFIXED: Regex =
        Regex::new(r"(?i)^(error|warn|warning|info|debug|trace)[:\s]\s*(.*)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Unrecognized levels read as `Info`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "ERROR" | "ERR" | "E" | "FATAL" | "PANIC" => LogLevel::Error,
            "WARN" | "WARNING" | "W" => LogLevel::Warn,
            "DEBUG" | "DBG" | "D" => LogLevel::Debug,
            "TRACE" | "T" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

// GET /logs body
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct LogsResponse {
    #[serde(default)]
    pub latest_timestamp: Option<i64>,
    #[serde(default)]
    pub lines: Vec<String>,
}

/// Parses one CLIProxyAPI log line. Lines in no known shape become `Info`
/// entries without a timestamp.
pub fn parse_log_line(line: &str) -> LogEntry {
    let line = line.trim();

    if let Some(caps) = BRACKETED.captures(line) {
        return LogEntry {
            timestamp: caps[1].trim().to_string(),
            level: LogLevel::normalize(&caps[2]),
            message: caps[3].trim().to_string(),
        };
    }

    if let Some(caps) = ISO_PREFIXED.captures(line) {
        return LogEntry {
            timestamp: caps[1].to_string(),
            level: LogLevel::normalize(&caps[2]),
            message: caps[3].trim().to_string(),
        };
    }

    if let Some(caps) = LEVEL_PREFIXED.captures(line) {
        return LogEntry {
            timestamp: String::new(),
            level: LogLevel::normalize(&caps[1]),
            message: caps[2].trim().to_string(),
        };
    }

    LogEntry {
        timestamp: String::new(),
        level: LogLevel::Info,
        message: line.to_string(),
    }
}

pub(crate) fn parse_lines(lines: &[String]) -> Vec<LogEntry> {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_log_line(line))
        .collect()
}
