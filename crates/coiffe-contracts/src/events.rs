use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Everything a retouch run can report, in roughly the order a single
/// retouch emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetouchEvent {
    RunStarted,
    PhotoLoaded,
    CacheHit,
    ReferenceColorSampled,
    ReferenceColorUnavailable,
    CreditsUpdated,
    PredictionStarted,
    PredictionFinished,
    PredictionFailed,
    ColorCorrectionDerived,
    CompositeCreated,
    RunFinished,
}

impl RetouchEvent {
    pub const ALL: [RetouchEvent; 12] = [
        Self::RunStarted,
        Self::PhotoLoaded,
        Self::CacheHit,
        Self::ReferenceColorSampled,
        Self::ReferenceColorUnavailable,
        Self::CreditsUpdated,
        Self::PredictionStarted,
        Self::PredictionFinished,
        Self::PredictionFailed,
        Self::ColorCorrectionDerived,
        Self::CompositeCreated,
        Self::RunFinished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PhotoLoaded => "photo_loaded",
            Self::CacheHit => "cache_hit",
            Self::ReferenceColorSampled => "reference_color_sampled",
            Self::ReferenceColorUnavailable => "reference_color_unavailable",
            Self::CreditsUpdated => "credits_updated",
            Self::PredictionStarted => "prediction_started",
            Self::PredictionFinished => "prediction_finished",
            Self::PredictionFailed => "prediction_failed",
            Self::ColorCorrectionDerived => "color_correction_derived",
            Self::CompositeCreated => "composite_created",
            Self::RunFinished => "run_finished",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == raw)
    }
}

impl fmt::Display for RetouchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only writer for a run's `events.jsonl`.
///
/// Every line carries `type`, `run_id` and `ts`. Those three are written after
/// the payload, so a payload key of the same name never masks them. Clones
/// share one file lock and can be handed to several retouch jobs of a run.
#[derive(Debug, Clone)]
pub struct EventWriter {
    log: Arc<RunLog>,
}

#[derive(Debug)]
struct RunLog {
    path: PathBuf,
    run_id: String,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            log: Arc::new(RunLog {
                path: path.into(),
                run_id: run_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn run_id(&self) -> &str {
        &self.log.run_id
    }

    pub fn emit(&self, event: RetouchEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let mut line = payload;
        line.insert("type".to_string(), Value::String(event.as_str().to_string()));
        line.insert("run_id".to_string(), Value::String(self.log.run_id.clone()));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.log.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .log
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

/// Event types in file order. Lines that fail to parse are skipped.
pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}

/// Known events in file order; unknown types are skipped.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<RetouchEvent>> {
    Ok(read_event_types(path)?
        .iter()
        .filter_map(|raw| RetouchEvent::parse(raw))
        .collect())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
