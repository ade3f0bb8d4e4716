// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Environment file parsing (`environment.yml`).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::channel::{Channel, ChannelRegistry};
use crate::matchspec::MatchSpec;
use crate::platform::Platform;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./spec_test.rs"]
mod spec_test;

/// An entry under `dependencies:`; either a requirement or a `pip:` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Requirement(String),
    Pip { pip: Vec<String> },
}

/// The environment file as written.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvironment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    /// Accepted for compatibility with `conda env export`; not resolved.
    #[serde(default)]
    #[allow(dead_code)]
    prefix: Option<String>,
}

/// A loaded, normalized environment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Optional environment name.
    pub name: Option<String>,

    /// Requirements in file order.
    pub requirements: Vec<MatchSpec>,

    /// Enabled channels in priority order.
    pub channels: Vec<Channel>,

    /// Target platform.
    pub platform: Platform,

    /// `pip:` entries, which are not resolved.
    pub pip_requirements: Vec<String>,

    /// Path to the file this was loaded from.
    pub source_path: Option<PathBuf>,
}

impl EnvironmentSpec {
    /// Load a spec with the built-in channel aliases and default platform.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        SpecLoader::default().load(path)
    }

    /// Parse a spec from YAML with the built-in defaults.
    pub fn from_yaml<S: AsRef<str>>(yaml: S) -> Result<Self> {
        SpecLoader::default().from_yaml(yaml.as_ref(), None)
    }

    /// Hash of everything that influences resolution.
    ///
    /// Channel URLs are left out so that a lock made against a local mirror
    /// stays current on another machine with the same channel names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("platform {}\n", self.platform));
        for channel in &self.channels {
            hasher.update(format!("channel {}\n", channel.name));
        }
        for requirement in &self.requirements {
            hasher.update(format!("requirement {requirement}\n"));
        }
        format!("sha256:{:x}", hasher.finalize())
    }

    /// Position of a channel in the priority list.
    pub fn channel_priority(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }
}

/// Turns environment files into [`EnvironmentSpec`] values.
#[derive(Debug, Clone)]
pub struct SpecLoader {
    registry: ChannelRegistry,
    default_platform: Platform,
    platform_override: Option<Platform>,
}

impl Default for SpecLoader {
    fn default() -> Self {
        Self {
            registry: ChannelRegistry::default(),
            default_platform: crate::DEFAULT_PLATFORM,
            platform_override: None,
        }
    }
}

impl SpecLoader {
    pub fn new(registry: ChannelRegistry, default_platform: Platform) -> Self {
        Self {
            registry,
            default_platform,
            platform_override: None,
        }
    }

    /// Force a platform regardless of what the file says.
    pub fn with_platform_override(mut self, platform: Option<Platform>) -> Self {
        self.platform_override = platform;
        self
    }

    /// Load spec from file path.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<EnvironmentSpec> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::ReadFailed {
            path: path.to_path_buf(),
            error: e,
        })?;

        let canonical = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let base_dir = canonical.parent().map(Path::to_path_buf);
        let mut spec = self
            .from_yaml(&yaml, base_dir.as_deref())
            .map_err(|err| match err {
                Error::MalformedSpec { path: None, message } => Error::MalformedSpec {
                    path: Some(path.to_path_buf()),
                    message,
                },
                other => other,
            })?;
        spec.source_path = Some(canonical);
        tracing::debug!(
            path = %path.display(),
            requirements = spec.requirements.len(),
            channels = spec.channels.len(),
            "loaded environment spec"
        );
        Ok(spec)
    }

    /// Parse spec from YAML string. Relative channel directories are
    /// resolved against `base_dir`.
    pub fn from_yaml(&self, yaml: &str, base_dir: Option<&Path>) -> Result<EnvironmentSpec> {
        let raw: RawEnvironment =
            serde_yaml::from_str(yaml).map_err(|e| Error::malformed(e.to_string()))?;

        let platform = match (self.platform_override, &raw.platform) {
            (Some(platform), _) => platform,
            (None, Some(platform)) => platform.parse()?,
            (None, None) => self.default_platform,
        };

        let channels = self.registry.normalize(&raw.channels, base_dir)?;

        let mut requirements = Vec::new();
        let mut pip_requirements = Vec::new();
        for dependency in raw.dependencies {
            match dependency {
                RawDependency::Requirement(text) => {
                    let requirement = self.parse_requirement(&text, &channels, base_dir)?;
                    requirements.push(requirement);
                }
                RawDependency::Pip { pip } => {
                    tracing::warn!(
                        count = pip.len(),
                        "pip requirements are not resolved and will be left out of the lock"
                    );
                    pip_requirements.extend(pip);
                }
            }
        }

        Ok(EnvironmentSpec {
            name: raw.name,
            requirements,
            channels,
            platform,
            pip_requirements,
            source_path: None,
        })
    }

    fn parse_requirement(
        &self,
        text: &str,
        channels: &[Channel],
        base_dir: Option<&Path>,
    ) -> Result<MatchSpec> {
        let mut requirement = MatchSpec::parse(text).map_err(|e| {
            Error::malformed(format!("invalid requirement '{text}': {}", inner_message(&e)))
        })?;

        if let Some(prefix) = &requirement.channel {
            let enabled = |name: &str| channels.iter().any(|c| c.name == name);
            let name = if enabled(prefix) {
                Some(prefix.clone())
            } else {
                self.registry
                    .resolve(prefix, base_dir)
                    .ok()
                    .map(|c| c.name)
                    .filter(|name| enabled(name))
            };
            let Some(name) = name else {
                return Err(Error::UnknownSource {
                    channel: prefix.clone(),
                    known: channels.iter().map(|c| c.name.clone()).collect(),
                });
            };
            requirement.channel = Some(name);
        }
        Ok(requirement)
    }
}

fn inner_message(err: &Error) -> String {
    match err {
        Error::MalformedSpec { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
