use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_retouches: u64,
    pub cache_hits: u64,
    pub credits_spent: u64,
    pub artifacts: Vec<Map<String, Value>>,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut artifact = Map::new();
        artifact.insert("image_path".to_string(), json!("retouch-01.jpg"));
        let summary = RunSummary {
            run_id: "run-123".to_string(),
            started_at: "2026-10-19T00:00:00+00:00".to_string(),
            finished_at: "2026-10-19T00:02:00+00:00".to_string(),
            total_retouches: 2,
            cache_hits: 1,
            credits_spent: 1,
            artifacts: vec![artifact],
        };
        let mut extra = Map::new();
        extra.insert("credits_remaining".to_string(), json!(4));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["total_retouches"], json!(2));
        assert_eq!(parsed["cache_hits"], json!(1));
        assert_eq!(parsed["artifacts"][0]["image_path"], json!("retouch-01.jpg"));
        assert_eq!(parsed["credits_remaining"], json!(4));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
