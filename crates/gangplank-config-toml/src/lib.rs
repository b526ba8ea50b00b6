// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the import engine and its driver.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// usable configuration.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub features: Features,

    #[serde(default)]
    pub import: ImportTuning,
}

/// Feature toggles gating optional import behavior.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Features {
    /// Allow an import to proceed with a blank VM definition when no
    /// matching template exists for the source VM. Off by default: a missing
    /// template fails the import.
    #[serde(default)]
    pub import_without_template: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ImportTuning {
    /// How many restarts of a transfer worker are tolerated before the
    /// import is declared crash-looping and failed.
    #[serde(default = "default_restart_tolerance")]
    pub worker_restart_tolerance: u32,
}

impl Default for ImportTuning {
    fn default() -> Self {
        Self { worker_restart_tolerance: default_restart_tolerance() }
    }
}

fn default_restart_tolerance() -> u32 {
    3
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config {
            features: Features { import_without_template: true },
            import: ImportTuning { worker_restart_tolerance: 5 },
        };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = toml::de::from_str("").unwrap();
        assert!(!cfg.features.import_without_template);
        assert_eq!(cfg.import.worker_restart_tolerance, 3);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let cfg: Config = toml::de::from_str("[features]\n").unwrap();
        assert!(!cfg.features.import_without_template);
        assert_eq!(cfg.import.worker_restart_tolerance, 3);
    }
}
