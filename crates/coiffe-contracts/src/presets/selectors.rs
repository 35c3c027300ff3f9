use super::registry::{PresetRegistry, PresetSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct PresetSelection {
    pub preset: PresetSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresetSelector {
    pub registry: PresetRegistry,
}

impl PresetSelector {
    pub fn new(registry: Option<PresetRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| PresetRegistry::new(None)),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<PresetSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let fallback_reason = if let Some(name) = requested {
            if let Some(preset) = self.registry.get(name) {
                return Ok(PresetSelection {
                    preset: preset.clone(),
                    requested: Some(name.to_string()),
                    fallback_reason: None,
                });
            }
            format!("Requested preset '{name}' unknown; using default.")
        } else {
            "No preset specified; using default.".to_string()
        };

        let Some(preset) = self.registry.default_preset().cloned() else {
            return Err("No presets configured.".to_string());
        };
        Ok(PresetSelection {
            preset,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}
