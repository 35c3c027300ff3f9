pub mod credits;
pub mod events;
pub mod presets;
pub mod runs;
