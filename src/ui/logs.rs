use chrono::{DateTime, SecondsFormat, Utc};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

// ---------------------------------------------------------------------------
// LogLevel: detected from log line text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

static LOG_LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(trace|debug|info|warn(?:ing)?|error|severe|fatal)\b"#)
        .expect("log level regex must compile")
});

/// Detect log level from a line of text.
pub fn detect_log_level(text: &str) -> Option<LogLevel> {
    LOG_LEVEL_RE.find(text).and_then(|m| {
        match m.as_str().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "severe" | "fatal" => Some(LogLevel::Error),
            _ => None,
        }
    })
}

// ---------------------------------------------------------------------------
// LogLine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub text: String,
    pub is_stderr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

impl LogLine {
    pub fn new(service: &str, text: String, is_stderr: bool) -> Self {
        let level = detect_log_level(&text);
        Self {
            timestamp: Utc::now(),
            service: service.to_string(),
            text,
            is_stderr,
            level,
        }
    }

    /// `2026-01-02T03:04:05.678Z err | text`
    pub fn to_file_line(&self) -> String {
        format!(
            "{} {} | {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            if self.is_stderr { "err" } else { "out" },
            self.text
        )
    }
}

// ---------------------------------------------------------------------------
// LogSink: one append-only file per service
// ---------------------------------------------------------------------------

/// Path of a service's log file inside `logs_dir`.
pub fn service_log_path(logs_dir: &Path, service: &str) -> PathBuf {
    logs_dir.join(format!("{service}.log"))
}

/// Append-only log file for a single service. Both output streams of every
/// process spawned for the service land here, one timestamped line each.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl LogSink {
    pub async fn open(logs_dir: &Path, service: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(logs_dir).await?;
        let path = service_log_path(logs_dir, service);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, line: &LogLine) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.to_file_line().as_bytes()).await?;
        file.flush().await
    }

    /// Supervisor bookkeeping lines (spawn, exit) share the file.
    pub async fn mark(&self, service: &str, text: impl Into<String>) -> std::io::Result<()> {
        self.write(&LogLine::new(service, format!("--- {} ---", text.into()), false))
            .await
    }
}

// ---------------------------------------------------------------------------
// LogWriter: colored terminal echo with owo-colors
// ---------------------------------------------------------------------------

pub struct LogWriter {
    rx: broadcast::Receiver<LogLine>,
    max_name_len: usize,
    use_color: bool,
}

/// Color palette for service names (using owo-colors).
const SERVICE_COLORS: &[fn(&str) -> String] = &[
    |s| format!("{}", s.cyan()),
    |s| format!("{}", s.yellow()),
    |s| format!("{}", s.green()),
    |s| format!("{}", s.magenta()),
    |s| format!("{}", s.blue()),
];

fn format_level(level: &LogLevel, use_color: bool) -> String {
    if !use_color {
        return format!("{:>5} ", level.as_str());
    }
    match level {
        LogLevel::Trace => format!("{} ", level.as_str().dimmed()),
        LogLevel::Debug => format!("{} ", level.as_str().blue()),
        LogLevel::Info => format!("{} ", level.as_str().green()),
        LogLevel::Warn => format!("{} ", level.as_str().yellow()),
        LogLevel::Error => format!("{} ", level.as_str().red()),
    }
}

impl LogWriter {
    pub fn new(rx: broadcast::Receiver<LogLine>, max_name_len: usize) -> Self {
        Self {
            rx,
            max_name_len,
            use_color: std::io::stdout().is_terminal(),
        }
    }

    fn render(&self, line: &LogLine, color_idx: usize) -> String {
        let mut buf = String::new();
        if self.use_color {
            let padding = self.max_name_len.saturating_sub(line.service.len());
            buf.push_str(&" ".repeat(padding));
            buf.push_str(&SERVICE_COLORS[color_idx](&line.service));
            buf.push_str(&format!(" {} ", "|".dimmed()));
        } else {
            buf.push_str(&format!(
                "{:>width$} | ",
                line.service,
                width = self.max_name_len,
            ));
        }
        if let Some(ref level) = line.level {
            buf.push_str(&format_level(level, self.use_color));
        }
        if self.use_color && line.is_stderr {
            buf.push_str(&format!("{}", line.text.red()));
        } else {
            buf.push_str(&line.text);
        }
        buf
    }

    pub async fn run(mut self) {
        let mut color_map: BTreeMap<String, usize> = BTreeMap::new();
        let mut next_color = 0usize;

        loop {
            let line = match self.rx.recv().await {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "console echo lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let color_idx = *color_map.entry(line.service.clone()).or_insert_with(|| {
                let idx = next_color;
                next_color = (next_color + 1) % SERVICE_COLORS.len();
                idx
            });
            println!("{}", self.render(&line, color_idx));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detect_levels() {
        assert_eq!(detect_log_level("[INFO] starting"), Some(LogLevel::Info));
        assert_eq!(detect_log_level("WARNING: deprecated"), Some(LogLevel::Warn));
        assert_eq!(
            detect_log_level("SEVERE: Tomcat failed to start"),
            Some(LogLevel::Error)
        );
        assert_eq!(detect_log_level("just a plain message"), None);
    }

    #[test]
    fn file_line_carries_timestamp_and_stream() {
        let line = LogLine::new("core", "listening".to_string(), true);
        let rendered = line.to_file_line();
        assert!(rendered.ends_with(" err | listening\n"), "{rendered}");
        let ts = rendered.split(' ').next().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "{ts}");
    }

    #[tokio::test]
    async fn sink_appends_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let logs = tmp.path().join("logs");

        let sink = LogSink::open(&logs, "core").await.unwrap();
        sink.write(&LogLine::new("core", "first".into(), false))
            .await
            .unwrap();
        drop(sink);

        let sink = LogSink::open(&logs, "core").await.unwrap();
        sink.mark("core", "spawned pid 42").await.unwrap();

        let content = std::fs::read_to_string(service_log_path(&logs, "core")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("out | first"));
        assert!(lines[1].ends_with("--- spawned pid 42 ---"));
    }

    #[test]
    fn plain_render_pads_service_name() {
        let (_tx, rx) = broadcast::channel(1);
        let writer = LogWriter {
            rx,
            max_name_len: 8,
            use_color: false,
        };
        let line = LogLine::new("ui", "ERROR boom".into(), false);
        assert_eq!(writer.render(&line, 0), "      ui | ERROR ERROR boom");
    }
}
