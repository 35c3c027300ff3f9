use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coiffe_contracts::credits::InMemoryCreditLedger;
use coiffe_contracts::presets::{CorrectionLevel, PresetRegistry};
use coiffe_engine::raster::normalize_output_extension;
use coiffe_engine::{
    compose_retouch, default_side_regions, sample_region_color, BlendSettings, ColorSample,
    CorrectionBounds, EllipseFractions, RasterImage, RegionSpec, RetouchEngine, RetouchOptions,
    SampleBand,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "coiffe", version, about = "Hair retouch compositor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Sample(SampleArgs),
    Composite(CompositeArgs),
    Retouch(RetouchArgs),
    Presets(PresetsArgs),
}

#[derive(Debug, Parser)]
struct BandArgs {
    #[arg(long, default_value_t = 20.0)]
    min_brightness: f64,
    #[arg(long, default_value_t = 200.0)]
    max_brightness: f64,
    #[arg(long, default_value_t = 30)]
    min_samples: usize,
}

impl BandArgs {
    fn band(&self) -> SampleBand {
        SampleBand {
            brightness_min: self.min_brightness,
            brightness_max: self.max_brightness,
            min_samples: self.min_samples,
        }
    }
}

#[derive(Debug, Parser)]
struct SampleArgs {
    #[arg(long)]
    image: PathBuf,
    /// Fractional region `x0,y0,x1,y1`; repeatable. Defaults to both sides of the head.
    #[arg(long = "region")]
    regions: Vec<String>,
    #[command(flatten)]
    band: BandArgs,
}

#[derive(Debug, Parser)]
struct CompositeArgs {
    #[arg(long)]
    background: PathBuf,
    #[arg(long)]
    foreground: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Fractional ellipse `cx,cy,rx,ry`.
    #[arg(long)]
    ellipse: Option<String>,
    #[arg(long)]
    fade: Option<f64>,
    /// `natural`, `aggressive` or `none`.
    #[arg(long, default_value = "natural")]
    correction: String,
    /// Reference hair color as `#RRGGBB`; sampled from the background when omitted.
    #[arg(long)]
    reference_color: Option<String>,
    #[arg(long, default_value_t = 0.6)]
    core_scale: f64,
    #[command(flatten)]
    band: BandArgs,
}

#[derive(Debug, Parser)]
struct RetouchArgs {
    #[arg(long)]
    photo: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    preset: Option<String>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "jpg")]
    output_format: String,
    #[arg(long, default_value_t = 10)]
    credits: u64,
    /// `natural`, `aggressive` or `none`; defaults to the preset's setting.
    #[arg(long)]
    correction: Option<String>,
    #[arg(long, default_value_t = 1024)]
    max_dimension: u32,
    #[arg(long)]
    ellipse: Option<String>,
    #[arg(long)]
    fade: Option<f64>,
    /// Provider option `key=value`; repeatable.
    #[arg(long = "option")]
    options: Vec<String>,
}

#[derive(Debug, Parser)]
struct PresetsArgs {
    /// Extra preset file merged over the built-in set.
    #[arg(long)]
    file: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("coiffe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Sample(args) => run_sample(args),
        Command::Composite(args) => run_composite(args),
        Command::Retouch(args) => run_retouch(args),
        Command::Presets(args) => run_presets(args),
    }
}

fn run_sample(args: SampleArgs) -> Result<i32> {
    let image = RasterImage::open(&args.image)?;
    let regions = parse_regions(&args.regions)?;
    let sample = sample_region_color(&image, &regions, &args.band.band());
    println!("{}", serde_json::to_string(&sample_json(sample))?);
    Ok(if sample.is_some() { 0 } else { 2 })
}

fn run_composite(args: CompositeArgs) -> Result<i32> {
    let background = RasterImage::open(&args.background)?;
    let foreground = RasterImage::open(&args.foreground)?;
    let correction = parse_correction(&args.correction)?;
    let reference = match args.reference_color.as_deref() {
        Some(raw) => Some(parse_hex_color(raw)?),
        None if correction.is_some() => {
            sample_region_color(&background, &default_side_regions(), &args.band.band())
        }
        None => None,
    };
    let composition = compose_retouch(
        &background,
        reference,
        &foreground,
        &BlendSettings {
            ellipse: ellipse_fractions(args.ellipse.as_deref(), args.fade)?,
            core_scale: args.core_scale,
            foreground_band: args.band.band(),
            correction: correction.map(CorrectionBounds::for_level),
        },
    )?;

    let ext = output_extension(&args.out);
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, composition.image.encode(ext)?)
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    let mut report = Map::new();
    report.insert(
        "out".to_string(),
        Value::String(args.out.to_string_lossy().to_string()),
    );
    report.insert("reference".to_string(), sample_json(reference));
    report.insert(
        "foreground".to_string(),
        sample_json(composition.foreground_color),
    );
    report.insert(
        "ratios".to_string(),
        json!(composition.correction.map(|correction| correction.ratios())),
    );
    report.insert(
        "ellipse".to_string(),
        Value::Object(composition.ellipse.to_json()),
    );
    println!("{}", serde_json::to_string(&Value::Object(report))?);
    Ok(0)
}

fn run_retouch(args: RetouchArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let ledger = Arc::new(InMemoryCreditLedger::new(args.credits));
    let mut engine = RetouchEngine::new(&args.out, &events_path, ledger)?;

    let mut options = RetouchOptions {
        preset: args.preset.clone(),
        provider: args.provider.clone(),
        model: args.model.clone(),
        output_format: args.output_format.clone(),
        max_dimension: args.max_dimension,
        ellipse: ellipse_fractions(args.ellipse.as_deref(), args.fade)?,
        provider_options: parse_provider_options(&args.options)?,
        ..RetouchOptions::default()
    };
    if let Some(raw) = args.correction.as_deref() {
        match parse_correction(raw)? {
            Some(level) => {
                options.correct_color = Some(true);
                options.correction_level = Some(level);
            }
            None => options.correct_color = Some(false),
        }
    }

    let result = engine.retouch(&args.photo, &options);
    engine.finish()?;
    let outcome = result?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "{}",
        serde_json::to_string(&json!({
            "image_path": outcome.image_path.to_string_lossy(),
            "receipt_path": outcome.receipt_path.to_string_lossy(),
            "preset": outcome.preset,
            "cached": outcome.cached,
            "reference_color": outcome.reference_color,
            "correction_ratios": outcome.correction_ratios,
            "credits_remaining": engine.credits_balance(),
        }))?
    );
    Ok(0)
}

fn run_presets(args: PresetsArgs) -> Result<i32> {
    let mut registry = PresetRegistry::from_env()?;
    if let Some(path) = args.file.as_deref() {
        registry.merge_file(path)?;
    }
    for preset in registry.list() {
        println!(
            "{}",
            serde_json::to_string(&json!({
                "name": preset.versioned_name(),
                "correct_color": preset.correct_color,
                "correction": preset.correction,
                "instructions": preset.instructions,
            }))?
        );
    }
    Ok(0)
}

fn sample_json(sample: Option<ColorSample>) -> Value {
    match sample {
        Some(color) => json!({
            "color": color.hex(),
            "rgb": color.channels(),
            "brightness": color.brightness(),
        }),
        None => Value::Null,
    }
}

fn parse_fractions<const N: usize>(raw: &str, label: &str) -> Result<[f64; N]> {
    let values = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("invalid {label} component '{}'", part.trim()))
        })
        .collect::<Result<Vec<f64>>>()?;
    let count = values.len();
    match <[f64; N]>::try_from(values) {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("{label} '{raw}' needs {N} comma-separated numbers, got {count}"),
    }
}

fn parse_regions(raw: &[String]) -> Result<Vec<RegionSpec>> {
    if raw.is_empty() {
        return Ok(default_side_regions());
    }
    raw.iter()
        .map(|value| {
            let [x0, y0, x1, y1] = parse_fractions::<4>(value, "region")?;
            Ok(RegionSpec::new(x0, y0, x1, y1))
        })
        .collect()
}

fn ellipse_fractions(raw: Option<&str>, fade: Option<f64>) -> Result<EllipseFractions> {
    let mut fractions = EllipseFractions::default();
    if let Some(raw) = raw {
        let [cx, cy, rx, ry] = parse_fractions::<4>(raw, "ellipse")?;
        fractions.center_x = cx;
        fractions.center_y = cy;
        fractions.radius_x = rx;
        fractions.radius_y = ry;
    }
    if let Some(fade) = fade {
        fractions.fade_width = fade;
    }
    Ok(fractions)
}

fn parse_correction(raw: &str) -> Result<Option<CorrectionLevel>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "natural" => Ok(Some(CorrectionLevel::Natural)),
        "aggressive" => Ok(Some(CorrectionLevel::Aggressive)),
        "none" | "off" => Ok(None),
        other => bail!("unknown correction level '{other}' (expected natural, aggressive or none)"),
    }
}

fn parse_hex_color(raw: &str) -> Result<ColorSample> {
    let digits = raw.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        bail!("invalid color '{raw}' (expected #RRGGBB)");
    }
    let channel = |index: usize| u8::from_str_radix(&digits[index..index + 2], 16);
    Ok(ColorSample::new(channel(0)?, channel(2)?, channel(4)?))
}

fn parse_provider_options(raw: &[String]) -> Result<Map<String, Value>> {
    let mut options = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("provider option '{entry}' must look like key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("provider option '{entry}' has an empty key");
        }
        let value = value.trim();
        let parsed = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|parsed| !parsed.is_string())
            .unwrap_or_else(|| Value::String(value.to_string()));
        options.insert(key.to_string(), parsed);
    }
    Ok(options)
}

fn output_extension(path: &Path) -> &'static str {
    normalize_output_extension(
        path.extension()
            .and_then(|value| value.to_str())
            .unwrap_or("png"),
    )
}
