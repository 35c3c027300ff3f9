pub mod compositor;
pub mod correction;
pub mod providers;
pub mod raster;
pub mod sampler;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use coiffe_contracts::credits::CreditLedger;
use coiffe_contracts::events::{EventWriter, RetouchEvent};
use coiffe_contracts::presets::{CorrectionLevel, PresetRegistry, PresetSelector, PresetSpec};
use coiffe_contracts::runs::cache::CacheStore;
use coiffe_contracts::runs::receipts::{
    build_receipt, write_receipt, ResolvedRetouch, RetouchRequest,
};
use coiffe_contracts::runs::summary::{write_summary, RunSummary};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use compositor::{blend_weight, composite_ellipse, EllipseFractions, EllipseParams};
pub use correction::{ColorCorrection, CorrectionBounds};
pub use providers::{
    default_provider_registry, encode_data_url, prediction_output_urls, PredictionOutcome,
    PredictionProvider, PredictionProviderRegistry, PredictionRequest,
};
pub use raster::RasterImage;
pub use sampler::{
    default_side_regions, sample_ellipse_color, sample_region_color, ColorSample, RegionSpec,
    SampleBand,
};

use providers::{map_object, truncate_text};

#[derive(Debug, Clone)]
pub struct RetouchOptions {
    pub preset: Option<String>,
    pub provider: String,
    pub model: Option<String>,
    pub output_format: String,
    /// Overrides the preset's `correct_color` when set.
    pub correct_color: Option<bool>,
    /// Overrides the preset's correction level when set.
    pub correction_level: Option<CorrectionLevel>,
    pub correction_bounds: Option<CorrectionBounds>,
    pub side_regions: Vec<RegionSpec>,
    pub reference_band: SampleBand,
    pub foreground_band: SampleBand,
    pub ellipse: EllipseFractions,
    pub core_scale: f64,
    pub max_dimension: u32,
    pub provider_options: Map<String, Value>,
}

impl Default for RetouchOptions {
    fn default() -> Self {
        Self {
            preset: None,
            provider: "dryrun".to_string(),
            model: None,
            output_format: "jpg".to_string(),
            correct_color: None,
            correction_level: None,
            correction_bounds: None,
            side_regions: default_side_regions(),
            reference_band: SampleBand::default(),
            foreground_band: SampleBand::default(),
            ellipse: EllipseFractions::default(),
            core_scale: 0.6,
            max_dimension: 1024,
            provider_options: Map::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlendSettings {
    pub ellipse: EllipseFractions,
    pub core_scale: f64,
    pub foreground_band: SampleBand,
    /// `None` disables color correction.
    pub correction: Option<CorrectionBounds>,
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub image: RasterImage,
    pub ellipse: EllipseParams,
    pub foreground_color: Option<ColorSample>,
    pub correction: Option<ColorCorrection>,
}

/// Blend a generated image back into the photo it was generated from.
///
/// `generated` is resized to the photo first. Correction is derived only when
/// requested and both the reference and the generated core color could be
/// sampled; otherwise the generated pixels are used as-is.
pub fn compose_retouch(
    photo: &RasterImage,
    reference: Option<ColorSample>,
    generated: &RasterImage,
    settings: &BlendSettings,
) -> Result<Composition> {
    let (width, height) = photo.dimensions();
    let foreground = generated.resized(width, height);
    let ellipse = settings.ellipse.resolve(width, height);

    let foreground_color = settings.correction.and_then(|_| {
        sample_ellipse_color(
            &foreground,
            &ellipse,
            settings.core_scale,
            &settings.foreground_band,
        )
    });
    let correction = match (settings.correction, reference, foreground_color) {
        (Some(bounds), Some(reference), Some(current)) => {
            Some(ColorCorrection::derive(reference, current, &bounds))
        }
        _ => None,
    };

    let image = composite_ellipse(photo, &foreground, &ellipse, correction.as_ref())?;
    Ok(Composition {
        image,
        ellipse,
        foreground_color,
        correction,
    })
}

#[derive(Debug, Clone)]
pub struct RetouchOutcome {
    pub image_path: PathBuf,
    pub receipt_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub preset: String,
    pub reference_color: Option<String>,
    pub foreground_color: Option<String>,
    pub correction_ratios: Option<[f64; 3]>,
    pub cached: bool,
    pub warnings: Vec<String>,
}

pub struct RetouchEngine {
    run_dir: PathBuf,
    run_id: String,
    events: EventWriter,
    cache: CacheStore,
    summary_path: PathBuf,
    started_at: String,
    presets: PresetSelector,
    providers: PredictionProviderRegistry,
    credits: Arc<dyn CreditLedger>,
    total_retouches: u64,
    cache_hits: u64,
    credits_spent: u64,
    artifacts: Vec<Map<String, Value>>,
}

impl RetouchEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        credits: Arc<dyn CreditLedger>,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        let events = EventWriter::new(events_path.into(), run_id.clone());
        let cache = CacheStore::new(run_dir.join("cache.json"));
        let summary_path = run_dir.join("summary.json");

        events.emit(
            RetouchEvent::RunStarted,
            map_object(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
                "credits": credits.balance(),
            })),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            cache,
            summary_path,
            started_at: now_utc_iso(),
            presets: PresetSelector::new(Some(PresetRegistry::from_env()?)),
            providers: default_provider_registry(),
            credits,
            total_retouches: 0,
            cache_hits: 0,
            credits_spent: 0,
            artifacts: Vec::new(),
        })
    }

    pub fn set_presets(&mut self, registry: PresetRegistry) {
        self.presets = PresetSelector::new(Some(registry));
    }

    pub fn register_provider<P: PredictionProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn presets(&self) -> impl Iterator<Item = &PresetSpec> {
        self.presets.registry.list()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn credits_balance(&self) -> u64 {
        self.credits.balance()
    }

    pub fn retouch(&mut self, photo_path: &Path, options: &RetouchOptions) -> Result<RetouchOutcome> {
        let bytes =
            fs::read(photo_path).with_context(|| format!("failed reading {}", photo_path.display()))?;
        let original = RasterImage::decode(&bytes)
            .with_context(|| format!("failed decoding photo {}", photo_path.display()))?;
        if original.is_empty() {
            bail!("photo {} has no pixels", photo_path.display());
        }
        let photo = original.fit_within(options.max_dimension);
        let (width, height) = photo.dimensions();
        self.events.emit(
            RetouchEvent::PhotoLoaded,
            map_object(json!({
                "photo": photo_path.to_string_lossy().to_string(),
                "original_width": original.width(),
                "original_height": original.height(),
                "width": width,
                "height": height,
            })),
        )?;

        let selection = self
            .presets
            .select(options.preset.as_deref())
            .map_err(anyhow::Error::msg)?;
        let preset = selection.preset;
        let mut warnings = Vec::new();
        if let Some(reason) = selection.fallback_reason {
            if selection.requested.is_some() {
                warnings.push(reason);
            }
        }
        let correct_color = options.correct_color.unwrap_or(preset.correct_color);
        let bounds = options.correction_bounds.unwrap_or_else(|| {
            CorrectionBounds::for_level(options.correction_level.unwrap_or(preset.correction))
        });

        let cache_key = stable_hash(&json!({
            "photo_sha256": sha256_hex(&bytes),
            "preset": preset.versioned_name(),
            "instructions": preset.instructions,
            "provider": options.provider,
            "model": options.model,
            "output_format": options.output_format,
            "correct_color": correct_color,
            "bounds": [bounds.ratio_min, bounds.ratio_max, bounds.tone_min, bounds.tone_max],
            "ellipse": [
                options.ellipse.center_x,
                options.ellipse.center_y,
                options.ellipse.radius_x,
                options.ellipse.radius_y,
                options.ellipse.fade_width,
            ],
            "side_regions": options
                .side_regions
                .iter()
                .map(|region| [region.x0, region.y0, region.x1, region.y1])
                .collect::<Vec<_>>(),
            "reference_band": band_key(&options.reference_band),
            "foreground_band": band_key(&options.foreground_band),
            "core_scale": options.core_scale,
            "max_dimension": options.max_dimension,
            "provider_options": options.provider_options,
        }));
        if let Some(outcome) = self.cached_outcome(&cache_key, warnings.clone())? {
            return Ok(outcome);
        }

        let reference = sample_region_color(&photo, &options.side_regions, &options.reference_band);
        match reference {
            Some(color) => self.events.emit(
                RetouchEvent::ReferenceColorSampled,
                map_object(json!({ "color": color.hex(), "brightness": color.brightness() })),
            )?,
            None => self.events.emit(
                RetouchEvent::ReferenceColorUnavailable,
                map_object(json!({ "regions": options.side_regions.len() })),
            )?,
        };

        let Some(provider) = self.providers.get(&options.provider) else {
            bail!(
                "unknown provider '{}' (available: {})",
                options.provider,
                self.providers.names().join(", ")
            );
        };
        let request = PredictionRequest {
            image_data_url: encode_data_url(&photo.encode("jpg")?, "image/jpeg"),
            instructions: preset.instructions.clone(),
            aspect_ratio: preset.aspect_ratio.clone(),
            output_quality: preset.output_quality,
            strength: preset.strength,
            model: options.model.clone(),
            provider_options: options.provider_options.clone(),
        };

        let balance = self.credits.spend(1)?;
        let started = Instant::now();
        let predicted = self
            .events
            .emit(
                RetouchEvent::CreditsUpdated,
                map_object(json!({ "spent": 1, "balance": balance })),
            )
            .and_then(|_| {
                self.events.emit(
                    RetouchEvent::PredictionStarted,
                    map_object(json!({
                        "provider": provider.name(),
                        "preset": preset.versioned_name(),
                        "model": options.model,
                    })),
                )
            })
            .and_then(|_| provider.predict(&request))
            .and_then(|outcome| {
                let generated = RasterImage::decode(&outcome.image.bytes)
                    .context("provider returned an undecodable image")?;
                Ok((outcome, generated))
            });
        let (outcome, generated) = match predicted {
            Ok(ok) => ok,
            Err(err) => {
                let balance = self.credits.refund(1)?;
                let logged = self
                    .events
                    .emit(
                        RetouchEvent::PredictionFailed,
                        map_object(json!({
                            "provider": options.provider,
                            "error": error_chain_text(&err, 512),
                        })),
                    )
                    .and_then(|_| {
                        self.events.emit(
                            RetouchEvent::CreditsUpdated,
                            map_object(json!({ "refunded": 1, "balance": balance })),
                        )
                    });
                let err = err.context(format!("{} prediction failed", options.provider));
                return match logged {
                    Ok(_) => Err(err),
                    Err(log_err) => {
                        Err(err.context(format!("event log unavailable: {log_err}")))
                    }
                };
            }
        };
        self.credits_spent += 1;
        warnings.extend(outcome.warnings.iter().cloned());
        self.events.emit(
            RetouchEvent::PredictionFinished,
            map_object(json!({
                "prediction_id": outcome.prediction_id,
                "source_url": outcome.source_url,
                "width": generated.width(),
                "height": generated.height(),
                "latency_s": started.elapsed().as_secs_f64(),
            })),
        )?;

        let composition = compose_retouch(
            &photo,
            reference,
            &generated,
            &BlendSettings {
                ellipse: options.ellipse,
                core_scale: options.core_scale,
                foreground_band: options.foreground_band,
                correction: correct_color.then_some(bounds),
            },
        )?;
        if let Some(correction) = &composition.correction {
            self.events.emit(
                RetouchEvent::ColorCorrectionDerived,
                map_object(json!({
                    "reference": reference.map(|color| color.hex()),
                    "foreground": composition.foreground_color.map(|color| color.hex()),
                    "ratios": correction.ratios(),
                })),
            )?;
        } else if correct_color {
            warnings.push(if reference.is_none() {
                "Color correction skipped: not enough hair pixels in the photo's side regions."
                    .to_string()
            } else {
                "Color correction skipped: not enough usable pixels in the generated region."
                    .to_string()
            });
        }

        let stamp = chrono::Utc::now().timestamp_millis();
        let index = self.total_retouches + 1;
        let ext = raster::normalize_output_extension(&options.output_format);
        let image_path = self
            .run_dir
            .join(format!("retouch-{stamp}-{index:02}.{ext}"));
        let receipt_path = self
            .run_dir
            .join(format!("receipt-{stamp}-{index:02}.json"));
        fs::write(&image_path, composition.image.encode(ext)?)
            .with_context(|| format!("failed to write {}", image_path.display()))?;

        let resolved = ResolvedRetouch {
            width,
            height,
            prediction_id: outcome.prediction_id.clone(),
            source_url: outcome.source_url.clone(),
            reference_color: reference.map(|color| color.hex()),
            foreground_color: composition.foreground_color.map(|color| color.hex()),
            correction_ratios: composition.correction.map(|correction| correction.ratios()),
            ellipse: composition.ellipse.to_json(),
            warnings: warnings.clone(),
        };
        let receipt = build_receipt(
            &RetouchRequest {
                photo: photo_path.to_string_lossy().to_string(),
                preset: preset.versioned_name(),
                instructions: preset.instructions.clone(),
                provider: options.provider.clone(),
                model: options.model.clone(),
                output_format: ext.to_string(),
                provider_options: options.provider_options.clone(),
            },
            &resolved,
            &outcome.provider_request,
            &outcome.provider_response,
            &image_path,
            &receipt_path,
        );
        write_receipt(&receipt_path, &receipt)?;

        let artifact = map_object(json!({
            "image_path": image_path.to_string_lossy().to_string(),
            "receipt_path": receipt_path.to_string_lossy().to_string(),
            "width": width,
            "height": height,
            "preset": preset.versioned_name(),
            "reference_color": resolved.reference_color,
            "foreground_color": resolved.foreground_color,
            "correction_ratios": resolved.correction_ratios,
        }));
        self.events.emit(RetouchEvent::CompositeCreated, artifact.clone())?;
        self.cache.set(&cache_key, artifact.clone())?;
        self.artifacts.push(artifact);
        self.total_retouches += 1;

        Ok(RetouchOutcome {
            image_path,
            receipt_path,
            width,
            height,
            preset: preset.versioned_name(),
            reference_color: resolved.reference_color,
            foreground_color: resolved.foreground_color,
            correction_ratios: resolved.correction_ratios,
            cached: false,
            warnings,
        })
    }

    pub fn finish(&mut self) -> Result<()> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_retouches: self.total_retouches,
            cache_hits: self.cache_hits,
            credits_spent: self.credits_spent,
            artifacts: self.artifacts.clone(),
        };
        let extra = map_object(json!({ "credits_remaining": self.credits.balance() }));
        write_summary(&self.summary_path, &summary, Some(&extra))?;
        self.events.emit(
            RetouchEvent::RunFinished,
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "total_retouches": self.total_retouches,
                "cache_hits": self.cache_hits,
            })),
        )?;
        Ok(())
    }

    fn cached_outcome(
        &mut self,
        cache_key: &str,
        warnings: Vec<String>,
    ) -> Result<Option<RetouchOutcome>> {
        let Some(entry) = self.cache.get(cache_key) else {
            return Ok(None);
        };
        let path_of = |key: &str| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .map(PathBuf::from)
        };
        let (Some(image_path), Some(receipt_path)) = (path_of("image_path"), path_of("receipt_path"))
        else {
            self.cache.remove(cache_key)?;
            return Ok(None);
        };
        if !image_path.exists() {
            self.cache.remove(cache_key)?;
            return Ok(None);
        }
        let text_of = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
        let ratios = entry
            .get("correction_ratios")
            .and_then(Value::as_array)
            .and_then(|rows| {
                let values: Vec<f64> = rows.iter().filter_map(Value::as_f64).collect();
                <[f64; 3]>::try_from(values).ok()
            });

        self.cache_hits += 1;
        self.events.emit(
            RetouchEvent::CacheHit,
            map_object(json!({
                "image_path": image_path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(Some(RetouchOutcome {
            width: entry.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
            height: entry.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
            preset: text_of("preset").unwrap_or_default(),
            reference_color: text_of("reference_color"),
            foreground_color: text_of("foreground_color"),
            correction_ratios: ratios,
            image_path,
            receipt_path,
            cached: true,
            warnings,
        }))
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn band_key(band: &SampleBand) -> Value {
    json!([band.brightness_min, band.brightness_max, band.min_samples])
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn stable_hash(payload: &Value) -> String {
    sha256_hex(&serde_json::to_vec(payload).unwrap_or_default())
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use anyhow::Result;
    use coiffe_contracts::credits::{CreditLedger, InMemoryCreditLedger};
    use coiffe_contracts::events::read_event_types;
    use serde_json::{json, Value};

    use super::*;

    const HAIR: [u8; 3] = [90, 60, 40];
    const SKIN: [u8; 3] = [200, 160, 140];

    /// Portrait-ish test photo: hair-colored sides, skin-colored middle.
    fn write_photo(dir: &Path) -> Result<PathBuf> {
        let (width, height) = (120u32, 160u32);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _y in 0..height {
            for x in 0..width {
                let fx = x as f64 / width as f64;
                let rgb = if !(0.35..0.65).contains(&fx) { HAIR } else { SKIN };
                data.extend_from_slice(&rgb);
            }
        }
        let path = dir.join("photo.png");
        fs::write(&path, RasterImage::new(width, height, data)?.encode("png")?)?;
        Ok(path)
    }

    fn engine(dir: &Path, credits: u64) -> Result<(RetouchEngine, Arc<InMemoryCreditLedger>, PathBuf)> {
        let ledger = Arc::new(InMemoryCreditLedger::new(credits));
        let run_dir = dir.join("run");
        let events_path = run_dir.join("events.jsonl");
        let engine = RetouchEngine::new(&run_dir, &events_path, ledger.clone())?;
        Ok((engine, ledger, events_path))
    }

    #[test]
    fn compose_without_correction_keeps_photo_outside_ellipse() -> Result<()> {
        let photo = RasterImage::filled(100, 100, [128, 128, 128]);
        let generated = RasterImage::filled(50, 80, [200, 50, 50]);
        let settings = BlendSettings {
            ellipse: EllipseFractions::default(),
            core_scale: 0.6,
            foreground_band: SampleBand::default(),
            correction: None,
        };
        let composition = compose_retouch(&photo, None, &generated, &settings)?;
        assert_eq!(composition.image.dimensions(), (100, 100));
        assert_eq!(composition.image.pixel(50, 20), Some([200, 50, 50]));
        assert_eq!(composition.image.pixel(50, 99), Some([128, 128, 128]));
        assert!(composition.correction.is_none());
        assert!(composition.foreground_color.is_none());
        Ok(())
    }

    #[test]
    fn compose_retints_core_toward_reference() -> Result<()> {
        let photo = RasterImage::filled(100, 100, [128, 128, 128]);
        let generated = RasterImage::filled(100, 100, [100, 100, 100]);
        let settings = BlendSettings {
            ellipse: EllipseFractions::default(),
            core_scale: 0.6,
            foreground_band: SampleBand::default(),
            correction: Some(CorrectionBounds::natural()),
        };
        let composition = compose_retouch(
            &photo,
            Some(ColorSample::new(110, 100, 90)),
            &generated,
            &settings,
        )?;
        assert_eq!(
            composition.foreground_color,
            Some(ColorSample::new(100, 100, 100))
        );
        assert_eq!(composition.image.pixel(50, 20), Some([110, 100, 90]));
        Ok(())
    }

    #[test]
    fn compose_skips_correction_without_reference() -> Result<()> {
        let photo = RasterImage::filled(60, 60, [128, 128, 128]);
        let generated = RasterImage::filled(60, 60, [100, 100, 100]);
        let settings = BlendSettings {
            ellipse: EllipseFractions::default(),
            core_scale: 0.6,
            foreground_band: SampleBand::default(),
            correction: Some(CorrectionBounds::aggressive()),
        };
        let composition = compose_retouch(&photo, None, &generated, &settings)?;
        assert!(composition.correction.is_none());
        assert_eq!(composition.image.pixel(30, 12), Some([100, 100, 100]));
        Ok(())
    }

    #[test]
    fn dryrun_retouch_writes_artifacts_receipt_and_events() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, ledger, events_path) = engine(temp.path(), 3)?;

        let mut options = RetouchOptions::default();
        options
            .provider_options
            .insert("dryrun_size".to_string(), json!("240x320"));
        let outcome = engine.retouch(&photo, &options)?;
        engine.finish()?;

        assert!(!outcome.cached);
        assert!(outcome.image_path.exists());
        assert_eq!((outcome.width, outcome.height), (120, 160));
        assert_eq!(outcome.preset, "natural-density@v3");
        assert_eq!(outcome.reference_color.as_deref(), Some("#5A3C28"));
        assert!(outcome.correction_ratios.is_some());
        assert_eq!(ledger.balance(), 2);

        let written = RasterImage::open(&outcome.image_path)?;
        assert_eq!(written.dimensions(), (120, 160));

        let receipt: Value = serde_json::from_str(&fs::read_to_string(&outcome.receipt_path)?)?;
        assert_eq!(receipt["request"]["provider"], json!("dryrun"));
        assert_eq!(receipt["provider_request"]["payload"]["image"], json!("<omitted>"));
        assert_eq!(receipt["resolved"]["reference_color"], json!("#5A3C28"));

        let types = read_event_types(&events_path)?;
        let position = |name: &str| {
            types
                .iter()
                .position(|value| value == name)
                .unwrap_or_else(|| panic!("missing {name}"))
        };
        assert!(position("run_started") < position("photo_loaded"));
        assert!(position("photo_loaded") < position("reference_color_sampled"));
        assert!(position("reference_color_sampled") < position("prediction_started"));
        assert!(position("prediction_started") < position("prediction_finished"));
        assert!(position("prediction_finished") < position("color_correction_derived"));
        assert!(position("color_correction_derived") < position("composite_created"));
        assert!(position("composite_created") < position("run_finished"));

        let summary: Value =
            serde_json::from_str(&fs::read_to_string(temp.path().join("run/summary.json"))?)?;
        assert_eq!(summary["total_retouches"], json!(1));
        assert_eq!(summary["credits_spent"], json!(1));
        assert_eq!(summary["credits_remaining"], json!(2));
        Ok(())
    }

    #[test]
    fn repeated_retouch_hits_cache_without_spending() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, ledger, events_path) = engine(temp.path(), 5)?;
        let options = RetouchOptions::default();

        let first = engine.retouch(&photo, &options)?;
        let second = engine.retouch(&photo, &options)?;
        assert!(second.cached);
        assert_eq!(second.image_path, first.image_path);
        assert_eq!(second.reference_color, first.reference_color);
        assert_eq!(second.correction_ratios, first.correction_ratios);
        assert_eq!(ledger.balance(), 4);
        assert!(read_event_types(&events_path)?.contains(&"cache_hit".to_string()));

        fs::remove_file(&first.image_path)?;
        let third = engine.retouch(&photo, &options)?;
        assert!(!third.cached);
        assert_eq!(ledger.balance(), 3);
        Ok(())
    }

    #[test]
    fn sampling_and_blend_options_miss_the_cache() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, ledger, _) = engine(temp.path(), 10)?;

        let first = engine.retouch(&photo, &RetouchOptions::default())?;
        assert!(first.correction_ratios.is_some());

        let starved = RetouchOptions {
            reference_band: SampleBand {
                min_samples: 1_000_000,
                ..SampleBand::default()
            },
            side_regions: vec![RegionSpec::new(0.4, 0.4, 0.6, 0.6)],
            core_scale: 0.1,
            ..RetouchOptions::default()
        };
        let second = engine.retouch(&photo, &starved)?;
        assert!(!second.cached);
        assert_eq!(second.reference_color, None);
        assert_eq!(second.correction_ratios, None);
        assert_ne!(second.image_path, first.image_path);

        let variants = [
            RetouchOptions {
                side_regions: vec![RegionSpec::new(0.0, 0.18, 0.30, 0.45)],
                ..RetouchOptions::default()
            },
            RetouchOptions {
                reference_band: SampleBand {
                    brightness_max: 150.0,
                    ..SampleBand::default()
                },
                ..RetouchOptions::default()
            },
            RetouchOptions {
                foreground_band: SampleBand {
                    min_samples: 10,
                    ..SampleBand::default()
                },
                ..RetouchOptions::default()
            },
            RetouchOptions {
                core_scale: 0.4,
                ..RetouchOptions::default()
            },
        ];
        for options in &variants {
            assert!(!engine.retouch(&photo, options)?.cached);
        }

        assert!(engine.retouch(&photo, &RetouchOptions::default())?.cached);
        assert_eq!(ledger.balance(), 10 - 2 - variants.len() as u64);
        Ok(())
    }

    /// Ledger that turns the event log into a directory as soon as a credit
    /// is spent, so the next append fails.
    struct LogBreakingLedger {
        inner: InMemoryCreditLedger,
        events_path: PathBuf,
    }

    impl CreditLedger for LogBreakingLedger {
        fn spend(&self, amount: u64) -> Result<u64> {
            let balance = self.inner.spend(amount)?;
            fs::remove_file(&self.events_path)?;
            fs::create_dir(&self.events_path)?;
            Ok(balance)
        }

        fn refund(&self, amount: u64) -> Result<u64> {
            self.inner.refund(amount)
        }

        fn balance(&self) -> u64 {
            self.inner.balance()
        }
    }

    #[test]
    fn event_log_failure_after_spend_refunds_credit() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let run_dir = temp.path().join("run");
        let events_path = run_dir.join("events.jsonl");
        let ledger = Arc::new(LogBreakingLedger {
            inner: InMemoryCreditLedger::new(2),
            events_path: events_path.clone(),
        });
        let mut engine = RetouchEngine::new(&run_dir, &events_path, ledger.clone())?;

        assert!(engine.retouch(&photo, &RetouchOptions::default()).is_err());
        assert_eq!(ledger.balance(), 2);
        assert!(events_path.is_dir());
        Ok(())
    }

    #[test]
    fn failed_prediction_refunds_credit() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, ledger, events_path) = engine(temp.path(), 1)?;
        let mut options = RetouchOptions::default();
        options
            .provider_options
            .insert("dryrun_fail".to_string(), json!("queue full"));

        let err = engine.retouch(&photo, &options).err().map(|err| format!("{err:#}"));
        assert!(err.unwrap_or_default().contains("queue full"));
        assert_eq!(ledger.balance(), 1);
        let types = read_event_types(&events_path)?;
        assert!(types.contains(&"prediction_failed".to_string()));
        assert!(!types.contains(&"composite_created".to_string()));
        Ok(())
    }

    #[test]
    fn empty_ledger_blocks_prediction() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, _, events_path) = engine(temp.path(), 0)?;

        let err = engine
            .retouch(&photo, &RetouchOptions::default())
            .err()
            .map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("insufficient credits: requested 1, available 0")
        );
        assert!(!read_event_types(&events_path)?.contains(&"prediction_started".to_string()));
        Ok(())
    }

    #[test]
    fn unknown_provider_and_preset_are_reported() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path())?;
        let (mut engine, ledger, _) = engine(temp.path(), 2)?;

        let options = RetouchOptions {
            provider: "stability".to_string(),
            ..RetouchOptions::default()
        };
        let err = engine.retouch(&photo, &options).err().map(|err| err.to_string());
        assert_eq!(
            err.as_deref(),
            Some("unknown provider 'stability' (available: dryrun, replicate)")
        );
        assert_eq!(ledger.balance(), 2);

        let options = RetouchOptions {
            preset: Some("mohawk".to_string()),
            correct_color: Some(false),
            ..RetouchOptions::default()
        };
        let outcome = engine.retouch(&photo, &options)?;
        assert_eq!(outcome.preset, "natural-density@v3");
        assert!(outcome.correction_ratios.is_none());
        assert_eq!(
            outcome.warnings,
            vec!["Requested preset 'mohawk' unknown; using default.".to_string()]
        );
        Ok(())
    }

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = anyhow::anyhow!("socket closed").context("Replicate poll request failed");
        assert_eq!(
            error_chain_text(&err, 512),
            "Replicate poll request failed | caused by: socket closed"
        );
    }
}
