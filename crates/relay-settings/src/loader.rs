//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. Merge the TOML file if it exists (missing file is not an error)
//! 3. Merge `RELAY_*` environment variables, `__` separating sections
//!    (`RELAY_HTTP__ADDR=127.0.0.1:9000`)
//! 4. Apply caller overrides (command-line flags)
//! 5. Validate

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Config file consulted when none is given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RELAY_";

/// Resolve the config file path.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf)
}

/// Build the layered figment without extracting it.
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(RelaySettings::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate settings from `path` plus the environment.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    load_from_path_with(path, |_| {})
}

/// Load and validate settings from the default or an explicit path.
pub fn load_settings(explicit: Option<&Path>) -> Result<RelaySettings> {
    load_settings_from_path(&settings_path(explicit))
}

/// Load settings, apply `overrides`, then validate the result.
///
/// Values replaced by `overrides` are never validated in their file or
/// environment form.
pub fn load_settings_with(
    explicit: Option<&Path>,
    overrides: impl FnOnce(&mut RelaySettings),
) -> Result<RelaySettings> {
    load_from_path_with(&settings_path(explicit), overrides)
}

fn load_from_path_with(
    path: &Path,
    overrides: impl FnOnce(&mut RelaySettings),
) -> Result<RelaySettings> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults and environment");
    }
    let mut settings: RelaySettings = figment(path).extract()?;
    overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}
