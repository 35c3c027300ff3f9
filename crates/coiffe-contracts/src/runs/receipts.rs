use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetouchRequest {
    pub photo: String,
    pub preset: String,
    pub instructions: String,
    pub provider: String,
    pub model: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub provider_options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRetouch {
    pub width: u32,
    pub height: u32,
    pub prediction_id: Option<String>,
    pub source_url: Option<String>,
    pub reference_color: Option<String>,
    pub foreground_color: Option<String>,
    pub correction_ratios: Option<[f64; 3]>,
    pub ellipse: Map<String, Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub fn build_receipt(
    request: &RetouchRequest,
    resolved: &ResolvedRetouch,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    image_path: &Path,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "resolved".to_string(),
        serde_json::to_value(resolved).unwrap_or(Value::Null),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "image_path".to_string(),
        Value::String(image_path.to_string_lossy().to_string()),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

// Photos travel to providers as data URLs; receipts keep the shape, not the bytes.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted>".to_string())
        }
        Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image_bytes" | "image_data_url" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn default_output_format() -> String {
    "jpg".to_string()
}
