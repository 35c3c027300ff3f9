mod registry;
mod selectors;

pub use registry::{CorrectionLevel, PresetRegistry, PresetSpec, PRESET_SCHEMA_VERSION};
pub use selectors::{PresetSelection, PresetSelector};
