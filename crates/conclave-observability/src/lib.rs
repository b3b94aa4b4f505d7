use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Console logging only; used by short-lived CLI invocations.
pub fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_ansi(true),
        )
        .try_init()
        .ok();
}

/// Console plus a daily-rolling JSONL file under `logs_dir`. The returned
/// guard must be held for the process lifetime or buffered lines are lost.
pub fn init_process_logging(
    process: &str,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("conclave.{process}"))
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("conclave.{process}"),
        retention_days,
        initialized_at: Utc::now(),
    };
    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("conclave.{process}.");

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }
        // expected: conclave.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if midnight.and_utc() < cutoff {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Replace secret material with a length-and-digest marker before logging.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_never_echoes_the_secret() {
        let secret = "sk-super-secret-value";
        let redacted = redact_text(secret);
        assert!(!redacted.contains("super-secret"));
        assert!(redacted.contains(&format!("len={}", secret.len())));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn stale_log_files_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("conclave.engine.2000-01-01.jsonl");
        let fresh = dir
            .path()
            .join(format!("conclave.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("notes.txt");
        for path in [&old, &fresh, &unrelated] {
            fs::write(path, b"{}").unwrap();
        }
        cleanup_old_jsonl(dir.path(), "engine", 7).unwrap();
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
