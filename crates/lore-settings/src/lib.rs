//! Layered configuration: compiled defaults, then `~/.lore/settings.json`,
//! then `LORE_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, lore_home, settings_path};
pub use types::*;
