use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const PRESET_SCHEMA_VERSION: u64 = 1;

const DEFAULT_PRESETS_JSON: &str = include_str!("../../resources/default_presets.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionLevel {
    #[default]
    Natural,
    Aggressive,
}

/// Named generation instructions plus the defaults sent alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetSpec {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u64,
    pub instructions: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_output_quality")]
    pub output_quality: u64,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default = "default_correct_color")]
    pub correct_color: bool,
    #[serde(default)]
    pub correction: CorrectionLevel,
}

impl PresetSpec {
    /// `name@vN`, recorded in receipts so a result can be traced to the exact text.
    pub fn versioned_name(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    schema_version: u64,
    presets: Vec<PresetSpec>,
}

#[derive(Debug, Clone)]
pub struct PresetRegistry {
    presets: IndexMap<String, PresetSpec>,
}

impl PresetRegistry {
    pub fn new(presets: Option<IndexMap<String, PresetSpec>>) -> Self {
        Self {
            presets: presets.unwrap_or_else(default_presets),
        }
    }

    /// Built-in presets, with `COIFFE_PRESETS_PATH` merged over them when set.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut registry = Self::new(None);
        if let Some(path) = presets_override_path() {
            registry.merge_file(&path)?;
        }
        Ok(registry)
    }

    /// Entries from `path` replace built-ins of the same name; new names append.
    pub fn merge_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading presets {}", path.display()))?;
        for preset in parse_presets(&raw)
            .with_context(|| format!("invalid presets file {}", path.display()))?
        {
            self.presets.insert(preset.name.clone(), preset);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PresetSpec> {
        self.presets.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &PresetSpec> {
        self.presets.values()
    }

    pub fn default_preset(&self) -> Option<&PresetSpec> {
        self.presets.values().next()
    }
}

fn parse_presets(raw: &str) -> anyhow::Result<Vec<PresetSpec>> {
    let file: PresetFile = serde_json::from_str(raw)?;
    if file.schema_version != PRESET_SCHEMA_VERSION {
        bail!(
            "unsupported preset schema_version {} (expected {PRESET_SCHEMA_VERSION})",
            file.schema_version
        );
    }
    for preset in &file.presets {
        if preset.name.trim().is_empty() {
            bail!("preset with empty name");
        }
        if preset.instructions.trim().is_empty() {
            bail!("preset '{}' has empty instructions", preset.name);
        }
    }
    Ok(file.presets)
}

fn presets_override_path() -> Option<PathBuf> {
    std::env::var("COIFFE_PRESETS_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn default_presets() -> IndexMap<String, PresetSpec> {
    parse_presets(DEFAULT_PRESETS_JSON)
        .unwrap_or_default()
        .into_iter()
        .map(|preset| (preset.name.clone(), preset))
        .collect()
}

fn default_version() -> u64 {
    1
}

fn default_aspect_ratio() -> String {
    "match_input_image".to_string()
}

fn default_output_quality() -> u64 {
    90
}

fn default_strength() -> f64 {
    0.55
}

fn default_correct_color() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{CorrectionLevel, PresetRegistry};

    #[test]
    fn builtin_presets_parse_in_file_order() {
        let registry = PresetRegistry::new(None);
        let names: Vec<&str> = registry.list().map(|preset| preset.name.as_str()).collect();
        assert_eq!(names.first().copied(), Some("natural-density"));
        assert!(names.contains(&"full-crown"));
        let crown = registry.get("full-crown").expect("missing full-crown");
        assert_eq!(crown.correction, CorrectionLevel::Aggressive);
        assert_eq!(crown.versioned_name(), "full-crown@v2");
    }

    #[test]
    fn merge_file_overrides_and_appends() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets.json");
        std::fs::write(
            &path,
            r#"{
                "schema_version": 1,
                "presets": [
                    {"name": "natural-density", "version": 9, "instructions": "override"},
                    {"name": "beard-fill", "instructions": "fill the beard", "correct_color": false}
                ]
            }"#,
        )?;
        let mut registry = PresetRegistry::new(None);
        registry.merge_file(&path)?;

        let overridden = registry.get("natural-density").map(|preset| preset.version);
        assert_eq!(overridden, Some(9));
        let appended = registry.get("beard-fill").map(|preset| preset.correct_color);
        assert_eq!(appended, Some(false));
        assert_eq!(
            registry.default_preset().map(|preset| preset.name.as_str()),
            Some("natural-density")
        );
        Ok(())
    }

    #[test]
    fn merge_file_rejects_unknown_schema() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets.json");
        std::fs::write(&path, r#"{"schema_version": 7, "presets": []}"#)?;
        let mut registry = PresetRegistry::new(None);
        let err = registry.merge_file(&path).err().map(|err| format!("{err:#}"));
        assert!(err
            .unwrap_or_default()
            .contains("unsupported preset schema_version 7"));
        Ok(())
    }
}
