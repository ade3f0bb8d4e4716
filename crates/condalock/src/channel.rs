// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Channel names, aliases and normalization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./channel_test.rs"]
mod channel_test;

/// Channel name that expands to the default channel list.
pub const DEFAULTS_CHANNEL: &str = "defaults";

/// Aliases known without any configuration.
static BUILTIN_ALIASES: Lazy<BTreeMap<String, String>> = Lazy::new(|| {
    BTreeMap::from([
        (
            "conda-forge".to_string(),
            "https://prefix.dev/conda-forge".to_string(),
        ),
        (
            "emscripten-forge".to_string(),
            "https://prefix.dev/emscripten-forge-dev".to_string(),
        ),
    ])
});

/// Channels used when a spec lists none (or lists `defaults`).
pub fn builtin_default_channels() -> Vec<String> {
    vec!["emscripten-forge".to_string(), "conda-forge".to_string()]
}

/// An enabled channel, in priority order within a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Channel {
    /// Name used in `channel::package` requirements and in the lock file.
    pub name: String,
    /// Base URL of the channel (`https://...` or `file://...`).
    pub url: String,
}

/// Where the metadata of a channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLocation {
    Remote(String),
    Local(PathBuf),
}

impl Channel {
    pub fn location(&self) -> ChannelLocation {
        match self.url.strip_prefix("file://") {
            Some(path) => ChannelLocation::Local(PathBuf::from(path)),
            None => ChannelLocation::Remote(self.url.clone()),
        }
    }

    /// A filesystem-safe key for caching this channel's metadata.
    pub fn cache_key(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Resolves raw channel strings from a spec into [`Channel`] values.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    aliases: BTreeMap<String, String>,
    default_channels: Vec<String>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            aliases: BUILTIN_ALIASES.clone(),
            default_channels: builtin_default_channels(),
        }
    }
}

impl ChannelRegistry {
    /// Add or replace an alias.
    pub fn with_alias<N: Into<String>, U: Into<String>>(mut self, name: N, url: U) -> Self {
        let url: String = url.into();
        self.aliases.insert(name.into(), clean_url(&url).to_string());
        self
    }

    /// Replace the channels used when a spec does not name any.
    pub fn with_default_channels(mut self, channels: Vec<String>) -> Self {
        if !channels.is_empty() {
            self.default_channels = channels;
        }
        self
    }

    pub fn known_aliases(&self) -> Vec<String> {
        self.aliases.keys().cloned().collect()
    }

    /// Normalize the channel list of a spec.
    ///
    /// Trailing slashes are trimmed, `defaults` expands to the default
    /// channels, duplicates keep their first position and an empty list
    /// means the default channels. Relative directories are resolved
    /// against `base_dir`.
    pub fn normalize(&self, raw: &[String], base_dir: Option<&Path>) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = Vec::new();
        let requested = if raw.is_empty() {
            self.default_channels.clone()
        } else {
            raw.to_vec()
        };

        for entry in &requested {
            for channel in self.expand(entry, base_dir)? {
                if !channels.iter().any(|c| c.name == channel.name) {
                    channels.push(channel);
                }
            }
        }
        Ok(channels)
    }

    fn expand(&self, raw: &str, base_dir: Option<&Path>) -> Result<Vec<Channel>> {
        let cleaned = clean_url(raw);
        if cleaned == DEFAULTS_CHANNEL {
            let mut expanded = Vec::new();
            for name in &self.default_channels {
                if name == DEFAULTS_CHANNEL {
                    continue;
                }
                expanded.push(self.resolve(name, base_dir)?);
            }
            return Ok(expanded);
        }
        Ok(vec![self.resolve(cleaned, base_dir)?])
    }

    /// Resolve one channel string (alias, URL or directory).
    pub fn resolve(&self, raw: &str, base_dir: Option<&Path>) -> Result<Channel> {
        let cleaned = clean_url(raw);
        if cleaned.is_empty() {
            return Err(Error::UnknownSource {
                channel: raw.to_string(),
                known: self.known_aliases(),
            });
        }

        if let Some(url) = self.aliases.get(cleaned) {
            return Ok(Channel {
                name: cleaned.to_string(),
                url: url.clone(),
            });
        }

        // a URL that is a mirror of an alias takes the alias name
        if let Some((name, url)) = self.aliases.iter().find(|(_, url)| *url == cleaned) {
            return Ok(Channel {
                name: name.clone(),
                url: url.clone(),
            });
        }

        if cleaned.starts_with("https://") || cleaned.starts_with("http://") {
            return Ok(Channel {
                name: cleaned.to_string(),
                url: cleaned.to_string(),
            });
        }

        let path = match cleaned.strip_prefix("file://") {
            Some(p) => PathBuf::from(p),
            None => {
                let p = PathBuf::from(cleaned);
                match base_dir {
                    Some(base) if p.is_relative() => base.join(p),
                    _ => p,
                }
            }
        };
        if path.is_dir() {
            let canonical = dunce::canonicalize(&path).map_err(|e| Error::ReadFailed {
                path: path.clone(),
                error: e,
            })?;
            return Ok(Channel {
                name: cleaned.to_string(),
                url: format!("file://{}", canonical.display()),
            });
        }

        Err(Error::UnknownSource {
            channel: raw.to_string(),
            known: self.known_aliases(),
        })
    }
}

fn clean_url(url: &str) -> &str {
    url.trim().trim_end_matches(['/', ' ', '\t'])
}
