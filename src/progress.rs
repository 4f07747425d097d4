//! Pipeline progress events.
//!
//! Stages publish [`PipelineEvent`]s to an [`EventSink`]; they never know
//! where events end up. A single consumer ([`spawn_consumer`]) drains the
//! channel, persists `(stage, percent)` onto the project and scan rows,
//! collects warnings, and forwards every event to a [`ProgressReporter`].
//!
//! Human and JSON reporters write to **stderr** so stdout stays parseable
//! for scripts.

use sqlx::SqlitePool;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db;
use crate::models::Stage;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    /// `processed` of `total` units done within the stage.
    StageProgress {
        stage: Stage,
        processed: u64,
        total: u64,
    },
    StageCompleted {
        stage: Stage,
        elapsed_ms: u64,
    },
    /// A recoverable problem, e.g. an unreadable file.
    Warning {
        stage: Stage,
        message: String,
    },
}

impl PipelineEvent {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineEvent::StageStarted { stage }
            | PipelineEvent::StageProgress { stage, .. }
            | PipelineEvent::StageCompleted { stage, .. }
            | PipelineEvent::Warning { stage, .. } => *stage,
        }
    }

    /// Overall scan percent implied by this event, if it carries one.
    pub fn overall_percent(&self) -> Option<u32> {
        match self {
            PipelineEvent::StageStarted { stage } => Some(stage.base_percent()),
            PipelineEvent::StageProgress {
                stage,
                processed,
                total,
            } => {
                let within = if *total == 0 {
                    0
                } else {
                    ((*processed).min(*total) * stage.weight() as u64 / *total) as u32
                };
                Some(stage.base_percent() + within)
            }
            PipelineEvent::StageCompleted { stage, .. } => {
                Some(stage.base_percent() + stage.weight())
            }
            PipelineEvent::Warning { .. } => None,
        }
    }
}

/// Publishing half of the event channel. Cheap to clone; a disabled sink
/// drops everything.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink with no consumer.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is listening any more.
            let _ = tx.send(event);
        }
    }

    pub fn started(&self, stage: Stage) {
        self.emit(PipelineEvent::StageStarted { stage });
    }

    pub fn progress(&self, stage: Stage, processed: u64, total: u64) {
        self.emit(PipelineEvent::StageProgress {
            stage,
            processed,
            total,
        });
    }

    pub fn completed(&self, stage: Stage, elapsed_ms: u64) {
        self.emit(PipelineEvent::StageCompleted { stage, elapsed_ms });
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(stage = %stage, "{}", message);
        self.emit(PipelineEvent::Warning { stage, message });
    }
}

/// Receives every pipeline event after it has been persisted.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, project_id: &str, event: &PipelineEvent);
}

/// Human-friendly progress on stderr: `scan acme  manifest  1,200 / 5,000`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, project_id: &str, event: &PipelineEvent) {
        let line = match event {
            PipelineEvent::StageStarted { stage } => {
                format!("scan {}  {}  started\n", project_id, stage)
            }
            PipelineEvent::StageProgress {
                stage,
                processed,
                total,
            } => format!(
                "scan {}  {}  {} / {}\n",
                project_id,
                stage,
                format_number(*processed),
                format_number(*total)
            ),
            PipelineEvent::StageCompleted { stage, elapsed_ms } => {
                format!("scan {}  {}  done in {} ms\n", project_id, stage, elapsed_ms)
            }
            PipelineEvent::Warning { stage, message } => {
                format!("scan {}  {}  warning: {}\n", project_id, stage, message)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, project_id: &str, event: &PipelineEvent) {
        let mut obj = match event {
            PipelineEvent::StageStarted { .. } => serde_json::json!({ "event": "stage_started" }),
            PipelineEvent::StageProgress {
                processed, total, ..
            } => serde_json::json!({
                "event": "progress",
                "processed": processed,
                "total": total
            }),
            PipelineEvent::StageCompleted { elapsed_ms, .. } => serde_json::json!({
                "event": "stage_completed",
                "elapsed_ms": elapsed_ms
            }),
            PipelineEvent::Warning { message, .. } => serde_json::json!({
                "event": "warning",
                "message": message
            }),
        };
        obj["project"] = serde_json::json!(project_id);
        obj["stage"] = serde_json::json!(event.stage().name());
        if let Some(percent) = event.overall_percent() {
            obj["percent"] = serde_json::json!(percent);
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _project_id: &str, _event: &PipelineEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

/// Start the single consumer for one scan.
///
/// The returned task finishes once every [`EventSink`] clone is dropped and
/// yields the warnings seen during the scan.
pub fn spawn_consumer(
    pool: SqlitePool,
    project_id: String,
    scan_id: i64,
    reporter: Arc<dyn ProgressReporter>,
) -> (EventSink, JoinHandle<Vec<String>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let handle = tokio::spawn(async move {
        let mut warnings = Vec::new();
        let mut last_percent: Option<(Stage, u32)> = None;

        while let Some(event) = rx.recv().await {
            if let PipelineEvent::Warning { stage, message } = &event {
                warnings.push(format!("{}: {}", stage, message));
            }

            if let Some(percent) = event.overall_percent() {
                let key = (event.stage(), percent);
                if last_percent != Some(key) {
                    last_percent = Some(key);
                    if let Err(e) =
                        persist_stage(&pool, &project_id, scan_id, event.stage(), percent).await
                    {
                        tracing::debug!(error = %e, "failed to persist stage progress");
                    }
                }
            }

            reporter.report(&project_id, &event);
        }
        warnings
    });
    (EventSink::new(tx), handle)
}

async fn persist_stage(
    pool: &SqlitePool,
    project_id: &str,
    scan_id: i64,
    stage: Stage,
    percent: u32,
) -> Result<(), sqlx::Error> {
    let now = db::unix_now();
    sqlx::query(
        "UPDATE projects SET current_stage = ?, stage_percent = ?, updated_at = ? WHERE id = ?",
    )
    .bind(stage.name())
    .bind(percent as i64)
    .bind(now)
    .bind(project_id)
    .execute(pool)
    .await?;
    sqlx::query("UPDATE scans SET current_stage = ?, stage_percent = ? WHERE id = ?")
        .bind(stage.name())
        .bind(percent as i64)
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}
