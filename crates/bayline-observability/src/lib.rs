//! Per-run structured logging.
//!
//! Two backends share one subscriber: a compact human console layer and a
//! JSONL file layer (daily rotation, non-blocking writer). The file writer
//! drops records rather than block the pipeline; drops are counted by the
//! appender and surfaced at shutdown. Backend selection is a process-wide
//! switch made once at init.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which backend carries the structured records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    /// Human-readable console only.
    Pretty,
    /// One self-describing JSON record per line, plus the console layer.
    Jsonl,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub backend: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();
static DROPPED_COUNTER: OnceLock<tracing_appender::non_blocking::ErrorCounter> = OnceLock::new();

/// Milliseconds since process logging started; monotonic, never wall-clock.
pub fn monotonic_ms() -> u64 {
    PROCESS_START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis() as u64
}

/// Records the lossy file writer dropped instead of blocking the pipeline.
pub fn dropped_records() -> u64 {
    DROPPED_COUNTER
        .get()
        .map(|c| c.dropped_lines() as u64)
        .unwrap_or(0)
}

/// Initialize process-wide logging. Returns the appender guard which must be
/// held for the process lifetime when the JSONL backend is active.
pub fn init_logging(
    backend: LogBackend,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(Option<WorkerGuard>, LoggingInitInfo)> {
    PROCESS_START.get_or_init(Instant::now);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let guard = match backend {
        LogBackend::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init()
                .ok();
            None
        }
        LogBackend::Jsonl => {
            fs::create_dir_all(logs_dir)?;
            let swept = sweep_rotated_logs(logs_dir, retention_days)?;

            let file_appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("bayline.engine")
                .filename_suffix("jsonl")
                .build(logs_dir)?;

            let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .lossy(true)
                .finish(file_appender);
            let _ = DROPPED_COUNTER.set(non_blocking.error_counter());

            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .ok();
            if swept > 0 {
                tracing::debug!(target: "bayline.logs", swept, "removed rotated logs past retention");
            }
            Some(guard)
        }
    };

    let info = LoggingInitInfo {
        backend: match backend {
            LogBackend::Pretty => "pretty".to_string(),
            LogBackend::Jsonl => "jsonl".to_string(),
        },
        logs_dir: logs_dir.display().to_string(),
        prefix: "bayline.engine".to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Deletes rotated log files whose last write fell out of the retention
/// window. Age is judged by filesystem mtime, the same way the artifact
/// sweep works, so imported or hand-renamed files age out too. Returns how
/// many files were removed.
fn sweep_rotated_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let max_age = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60));
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let rotated = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("bayline.engine") && n.ends_with(".jsonl"))
            .unwrap_or(false);
        if !rotated || !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Correlated logger for one pipeline run. Every record carries the skill
/// name, the run id and a monotonic timestamp.
#[derive(Clone)]
pub struct RunLogger {
    skill: &'static str,
    run_id: String,
}

impl RunLogger {
    pub fn new(skill: &'static str, run_id: impl Into<String>) -> Self {
        Self {
            skill,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn event(&self, level: Level, msg: &str) {
        match level {
            Level::ERROR => tracing::error!(
                target: "bayline.run",
                skill = self.skill,
                run_id = %self.run_id,
                t_ms = monotonic_ms(),
                "{msg}"
            ),
            Level::WARN => tracing::warn!(
                target: "bayline.run",
                skill = self.skill,
                run_id = %self.run_id,
                t_ms = monotonic_ms(),
                "{msg}"
            ),
            Level::DEBUG => tracing::debug!(
                target: "bayline.run",
                skill = self.skill,
                run_id = %self.run_id,
                t_ms = monotonic_ms(),
                "{msg}"
            ),
            _ => tracing::info!(
                target: "bayline.run",
                skill = self.skill,
                run_id = %self.run_id,
                t_ms = monotonic_ms(),
                "{msg}"
            ),
        }
    }

    pub fn info(&self, msg: &str) {
        self.event(Level::INFO, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.event(Level::WARN, msg);
    }

    pub fn error(&self, msg: &str) {
        self.event(Level::ERROR, msg);
    }

    /// Counter / rate metric record.
    pub fn metric(&self, name: &str, value: f64) {
        tracing::info!(
            target: "bayline.metric",
            skill = self.skill,
            run_id = %self.run_id,
            metric = name,
            value,
            t_ms = monotonic_ms(),
            "metric"
        );
    }

    /// Start a timed step. The returned handle emits a duration-annotated
    /// record when ended with an outcome.
    pub fn step(&self, name: impl Into<String>) -> StepHandle {
        let name = name.into();
        tracing::debug!(
            target: "bayline.run",
            skill = self.skill,
            run_id = %self.run_id,
            step = %name,
            t_ms = monotonic_ms(),
            "step start"
        );
        StepHandle {
            logger: self.clone(),
            name,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
}

impl StepOutcome {
    fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Failed => "failed",
            StepOutcome::Skipped => "skipped",
        }
    }
}

pub struct StepHandle {
    logger: RunLogger,
    name: String,
    started: Instant,
}

impl StepHandle {
    pub fn end(self, outcome: StepOutcome) -> u64 {
        self.end_with_detail(outcome, None)
    }

    pub fn end_with_detail(self, outcome: StepOutcome, detail: Option<&str>) -> u64 {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(
            target: "bayline.run",
            skill = self.logger.skill,
            run_id = %self.logger.run_id,
            step = %self.name,
            outcome = outcome.as_str(),
            elapsed_ms,
            detail = detail.unwrap_or(""),
            t_ms = monotonic_ms(),
            "step end"
        );
        elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn step_handle_reports_elapsed() {
        let logger = RunLogger::new("estimate", "run-1");
        let step = logger.step("identify_vehicle");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = step.end(StepOutcome::Ok);
        assert!(elapsed >= 5);
    }

    #[test]
    fn retention_sweep_judges_age_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("bayline.engine.2026-06-20.jsonl");
        let fresh = dir.path().join("bayline.engine.2026-08-01.jsonl");
        let unrelated = dir.path().join("notes.txt");
        for path in [&stale, &fresh, &unrelated] {
            std::fs::write(path, "{}").unwrap();
        }
        let past_retention = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);
        let file = std::fs::File::options().write(true).open(&stale).unwrap();
        file.set_modified(past_retention).unwrap();

        let swept = sweep_rotated_logs(dir.path(), 30).unwrap();

        assert_eq!(swept, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
