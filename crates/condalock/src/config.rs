// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Layered user configuration.
//!
//! Lowest to highest precedence: built-in defaults, the user file at
//! `<config dir>/create-lock/config.yaml`, an explicit file, and
//! `CREATE_LOCK__*` environment variables (`CREATE_LOCK__SOLVER__MAX_DECISIONS`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelRegistry, builtin_default_channels};
use crate::index::VirtualPackages;
use crate::platform::Platform;
use crate::resolver::{DEFAULT_MAX_DECISIONS, ResolverOptions};
use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "CREATE_LOCK";

/// Name of the per-user config directory and cache directory.
const APP_DIR: &str = "create-lock";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Platform used when a spec does not name one.
    pub default_platform: Platform,
    /// Where repodata of remote channels is cached.
    pub cache_dir: Option<PathBuf>,
    /// Channels used when a spec lists none.
    pub default_channels: Vec<String>,
    /// Extra channel aliases, name to URL.
    pub channels: BTreeMap<String, String>,
    /// Virtual package versions (`__glibc: "2.28"`) overriding the
    /// platform defaults; an empty version hides the package.
    pub virtual_packages: BTreeMap<String, String>,
    pub solver: Solver,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Solver {
    pub max_decisions: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_platform: crate::DEFAULT_PLATFORM,
            cache_dir: None,
            default_channels: builtin_default_channels(),
            channels: BTreeMap::new(),
            virtual_packages: BTreeMap::new(),
            solver: Solver::default(),
        }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            max_decisions: DEFAULT_MAX_DECISIONS,
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load all configuration layers, adding `explicit` above the user file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let user = dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.yaml"));
        Self::from_layers(user.as_deref(), explicit, env_source())
    }

    /// Load a single file over the defaults, ignoring the user file and
    /// the environment.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_layers(None, Some(path.as_ref()), None)
    }

    fn from_layers(
        user: Option<&Path>,
        explicit: Option<&Path>,
        env: Option<Environment>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = user {
            tracing::debug!(path = %path.display(), "reading user config");
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Yaml)
                    .required(false),
            );
        }
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        if let Some(env) = env {
            builder = builder.add_source(env);
        }
        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Channel aliases and defaults for loading specs.
    pub fn registry(&self) -> ChannelRegistry {
        let registry = self
            .channels
            .iter()
            .fold(ChannelRegistry::default(), |registry, (name, url)| {
                registry.with_alias(name, url)
            });
        registry.with_default_channels(self.default_channels.clone())
    }

    /// The configured cache directory, or the platform default.
    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".").join(".create-lock-cache")),
        }
    }

    pub fn virtual_packages(&self) -> VirtualPackages {
        VirtualPackages::new(self.virtual_packages.clone())
    }

    /// Resolver limits from the `solver` section.
    pub fn resolver_options(&self) -> ResolverOptions {
        let options = ResolverOptions::default().with_max_decisions(self.solver.max_decisions);
        match self.solver.timeout_secs {
            Some(secs) => options.with_timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}

fn env_source() -> Option<Environment> {
    Some(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("default_channels"),
    )
}
