//! # relay-settings
//!
//! Configuration for the saga relay, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **TOML file**: `relay.toml` or the path given on the command line
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed down explicitly.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    DEFAULT_CONFIG_FILE, load_settings, load_settings_from_path, load_settings_with, settings_path,
};
pub use types::*;
