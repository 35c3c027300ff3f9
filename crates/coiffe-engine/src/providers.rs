use std::collections::BTreeMap;
use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::raster::RasterImage;

const DEFAULT_REPLICATE_MODEL: &str = "black-forest-labs/flux-kontext-pro";

#[derive(Debug, Clone)]
pub struct PredictionRequest {
    /// `data:<mime>;base64,<payload>` of the normalized photo.
    pub image_data_url: String,
    pub instructions: String,
    pub aspect_ratio: String,
    pub output_quality: u64,
    pub strength: f64,
    pub model: Option<String>,
    pub provider_options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    pub prediction_id: Option<String>,
    pub source_url: Option<String>,
    pub image: ImageBytes,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// A hosted image model that edits a photo according to text instructions.
///
/// Implementations block until the remote job reaches a terminal state and
/// return the downloaded image, or an error naming the failure reason.
pub trait PredictionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, request: &PredictionRequest) -> Result<PredictionOutcome>;
}

#[derive(Default)]
pub struct PredictionProviderRegistry {
    providers: BTreeMap<String, Box<dyn PredictionProvider>>,
}

impl PredictionProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: PredictionProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn PredictionProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> PredictionProviderRegistry {
    let mut providers = PredictionProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(ReplicateProvider::new());
    providers
}

/// Offline stand-in: tints the input photo with a color derived from the
/// instructions so runs are reproducible without network access.
pub struct DryrunProvider;

impl PredictionProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn predict(&self, request: &PredictionRequest) -> Result<PredictionOutcome> {
        if let Some(reason) = request
            .provider_options
            .get("dryrun_fail")
            .and_then(Value::as_str)
        {
            bail!("dryrun prediction failed: {reason}");
        }
        let (_, bytes) = decode_data_url(&request.image_data_url)?;
        let photo = RasterImage::decode(&bytes)?;
        let (width, height) = request
            .provider_options
            .get("dryrun_size")
            .and_then(Value::as_str)
            .and_then(parse_dims)
            .unwrap_or_else(|| photo.dimensions());
        let tint = color_from_instructions(&request.instructions);
        let tinted: Vec<u8> = photo
            .resized(width, height)
            .as_raw()
            .chunks_exact(3)
            .flat_map(|pixel| {
                [
                    ((pixel[0] as u16 + tint[0] as u16) / 2) as u8,
                    ((pixel[1] as u16 + tint[1] as u16) / 2) as u8,
                    ((pixel[2] as u16 + tint[2] as u16) / 2) as u8,
                ]
            })
            .collect();
        let generated = RasterImage::new(width, height, tinted)?;
        let prediction_id = format!("dryrun-{}", &hex::encode(tint)[..6]);

        Ok(PredictionOutcome {
            prediction_id: Some(prediction_id.clone()),
            source_url: None,
            image: ImageBytes {
                bytes: generated.encode("png")?,
                mime_type: Some("image/png".to_string()),
            },
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "image": request.image_data_url,
                    "prompt": request.instructions,
                    "aspect_ratio": request.aspect_ratio,
                    "output_quality": request.output_quality,
                    "strength": request.strength,
                }
            })),
            provider_response: map_object(json!({
                "id": prediction_id,
                "status": "succeeded",
                "width": width,
                "height": height,
            })),
            warnings: Vec::new(),
        })
    }
}

pub struct ReplicateProvider {
    api_base: String,
    http: HttpClient,
}

impl ReplicateProvider {
    pub fn new() -> Self {
        Self::with_api_base(
            env::var("REPLICATE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
        )
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
    }

    fn resolve_model(request: &PredictionRequest) -> String {
        request
            .provider_options
            .get("replicate_model")
            .and_then(Value::as_str)
            .or(request.model.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_REPLICATE_MODEL)
            .to_string()
    }

    fn poll_interval_seconds(request: &PredictionRequest) -> f64 {
        value_as_f64(request.provider_options.get("poll_interval"), 1.0, 0.2, 5.0)
    }

    fn poll_timeout_seconds(request: &PredictionRequest) -> f64 {
        value_as_f64(request.provider_options.get("poll_timeout"), 120.0, 10.0, 600.0)
    }

    fn poll_max_attempts(request: &PredictionRequest) -> usize {
        value_as_f64(request.provider_options.get("poll_max_attempts"), 60.0, 1.0, 600.0) as usize
    }

    fn submit_max_retries(request: &PredictionRequest) -> usize {
        value_as_f64(request.provider_options.get("submit_retries"), 2.0, 0.0, 5.0) as usize
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn build_input(request: &PredictionRequest) -> Map<String, Value> {
        let image_key = request
            .provider_options
            .get("image_input_key")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("input_image")
            .to_string();
        let mut input = map_object(json!({
            "prompt": request.instructions,
            "aspect_ratio": request.aspect_ratio,
            "output_quality": request.output_quality,
            "prompt_strength": request.strength,
            "output_format": "png",
        }));
        input.insert(image_key, Value::String(request.image_data_url.clone()));
        for (key, value) in &request.provider_options {
            let normalized = key.trim().to_ascii_lowercase();
            if matches!(
                normalized.as_str(),
                "replicate_model"
                    | "image_input_key"
                    | "poll_interval"
                    | "poll_timeout"
                    | "poll_max_attempts"
                    | "submit_retries"
            ) {
                continue;
            }
            if input.contains_key(key) {
                continue;
            }
            input.insert(key.clone(), value.clone());
        }
        input
    }

    fn submit(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        max_retries: usize,
        warnings: &mut Vec<String>,
    ) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(endpoint)
                .bearer_auth(api_key)
                .header("Prefer", "wait")
                .json(payload)
                .send();
            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Replicate request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    push_unique_warning(
                        warnings,
                        format!("Replicate transport retry {attempt}/{max_retries}."),
                    );
                    thread::sleep(Duration::from_millis(350 * attempt as u64));
                }
            }
        }
    }

    fn poll_prediction(
        &self,
        poll_url: &str,
        api_key: &str,
        interval_s: f64,
        timeout_s: f64,
        max_attempts: usize,
    ) -> Result<Value> {
        let started = Instant::now();
        for attempt in 1..=max_attempts {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!(
                    "Replicate prediction {}: {}",
                    prediction_status(&payload),
                    failure_reason(&payload)
                ),
                _ => {}
            }
            if started.elapsed().as_secs_f64() >= timeout_s {
                bail!("Replicate polling timed out after {:.1}s", timeout_s);
            }
            if attempt < max_attempts {
                thread::sleep(Duration::from_secs_f64(interval_s));
            }
        }
        bail!("Replicate prediction still pending after {max_attempts} polls")
    }

    fn download_image(&self, url: &str) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading Replicate image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Replicate image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading Replicate image bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

impl Default for ReplicateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn predict(&self, request: &PredictionRequest) -> Result<PredictionOutcome> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let endpoint = self.predictions_endpoint();
        let model = Self::resolve_model(request);
        let mut warnings = Vec::new();
        let payload = map_object(json!({
            "model": model,
            "input": Self::build_input(request),
        }));

        let response = self.submit(
            &endpoint,
            &api_key,
            &Value::Object(payload.clone()),
            Self::submit_max_retries(request),
            &mut warnings,
        )?;
        let mut prediction = response_json_or_error("Replicate", response)?;
        match prediction_status(&prediction).as_str() {
            "succeeded" => {}
            "starting" | "processing" => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("Replicate prediction missing poll URL"))?
                    .to_string();
                prediction = self.poll_prediction(
                    &poll_url,
                    &api_key,
                    Self::poll_interval_seconds(request),
                    Self::poll_timeout_seconds(request),
                    Self::poll_max_attempts(request),
                )?;
            }
            status => bail!(
                "Replicate prediction {}: {}",
                if status.is_empty() { "unknown" } else { status },
                failure_reason(&prediction)
            ),
        }

        let urls = prediction
            .get("output")
            .map(prediction_output_urls)
            .unwrap_or_default();
        let Some(source_url) = urls.first().cloned() else {
            bail!("Replicate response returned no image URLs");
        };
        if urls.len() > 1 {
            push_unique_warning(
                &mut warnings,
                format!("Replicate returned {} images; using the first.", urls.len()),
            );
        }
        let image = self.download_image(&source_url)?;
        let prediction_id = prediction
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(PredictionOutcome {
            prediction_id: prediction_id.clone(),
            source_url: Some(source_url),
            image,
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "id": prediction_id,
                "status": prediction.get("status").cloned().unwrap_or(Value::Null),
                "metrics": prediction.get("metrics").cloned().unwrap_or(Value::Null),
            })),
            warnings,
        })
    }
}

/// Normalizes a prediction's `output` into image URLs.
///
/// Hosted models answer with a bare string, an array of strings, or objects
/// carrying `url`/`urls`/`output`; all of them collapse to a de-duplicated
/// list of http(s) URLs in response order.
pub fn prediction_output_urls(output: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_output_urls(output, &mut out);
    out
}

fn collect_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                collect_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(nested) = obj.get(key) {
                    collect_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

pub fn encode_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

pub fn decode_data_url(raw: &str) -> Result<(String, Vec<u8>)> {
    let Some(rest) = raw.trim().strip_prefix("data:") else {
        bail!("not a data URL");
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("data URL missing payload separator");
    };
    let Some(mime_type) = header.strip_suffix(";base64") else {
        bail!("data URL is not base64 encoded");
    };
    let bytes = BASE64
        .decode(payload.trim())
        .context("data URL payload is not valid base64")?;
    Ok((mime_type.to_string(), bytes))
}

fn prediction_status(payload: &Value) -> String {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn failure_reason(payload: &Value) -> String {
    match payload.get("error") {
        Some(Value::String(text)) if !text.trim().is_empty() => truncate_text(text.trim(), 512),
        Some(Value::Null) | None => "no reason given".to_string(),
        Some(other) => truncate_text(&other.to_string(), 512),
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

fn color_from_instructions(instructions: &str) -> [u8; 3] {
    let mut hasher = Sha256::new();
    hasher.update(instructions.as_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}

fn parse_dims(raw: &str) -> Option<(u32, u32)> {
    let (width, height) = raw.trim().to_ascii_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse::<u32>().ok(), h.trim().parse::<u32>().ok())
    })?;
    match (width?, height?) {
        (0, _) | (_, 0) => None,
        dims => Some(dims),
    }
}

pub(crate) fn value_as_f64(value: Option<&Value>, default: f64, min: f64, max: f64) -> f64 {
    let parsed = value.and_then(|row| match row {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    });
    parsed
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() || warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
