//! Configuration management for tundler

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{TundlerError, TundlerResult};
use crate::provider::ProviderRegistry;

pub const CONFIG_FILE_NAME: &str = "tundler.toml";

/// Main tundler configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TundlerConfig {
    /// Verbose logging
    pub debug: bool,
    /// Send anonymous connect events
    pub telemetry: bool,
    /// Per-provider settings, keyed by provider name
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Allow-list of locations used when a connect names none
    pub locations: Vec<String>,
}

/// `$XDG_CONFIG_HOME/tundler/tundler.toml`, if a home directory is known
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "tundler").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl TundlerConfig {
    /// Load configuration from file; a missing file is the default config
    pub fn load<P: AsRef<Path>>(path: P) -> TundlerResult<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(TundlerError::ConfigError(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> TundlerResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Check configured allow-lists against what each provider offers right now
///
/// Unknown providers are ignored and locations missing from the live list are
/// dropped, both with a warning. Providers left with an empty list are
/// omitted.
pub async fn resolve_locations(
    config: &TundlerConfig,
    registry: &ProviderRegistry,
) -> HashMap<String, Vec<String>> {
    let mut resolved = HashMap::new();

    for (name, provider_config) in &config.providers {
        let Some(provider) = registry.get(name) else {
            warn!("Ignoring config for unknown provider {}", name);
            continue;
        };
        if provider_config.locations.is_empty() {
            continue;
        }

        let live = provider.locations().await;
        let (kept, dropped): (Vec<String>, Vec<String>) = provider_config
            .locations
            .iter()
            .cloned()
            .partition(|loc| live.contains(loc));

        for loc in &dropped {
            warn!("Dropping location {} for {}: not offered by the provider", loc, name);
        }
        if !kept.is_empty() {
            debug!("{} restricted to {:?}", name, kept);
            resolved.insert(name.clone(), kept);
        }
    }

    resolved
}
