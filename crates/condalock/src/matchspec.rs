// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Requirement strings: `[channel::]name[ ]constraint[ build]`.
//!
//! The same grammar is used for the `dependencies:` of an environment file
//! and for the `depends` of every candidate in a channel.
//!
//! | requirement             | meaning                                  |
//! |-------------------------|------------------------------------------|
//! | `numpy`                 | any version                              |
//! | `numpy ==1.26.4`        | exactly 1.26.4                           |
//! | `numpy 1.26.4`          | exactly 1.26.4                           |
//! | `numpy=1.26`            | 1.26 or any 1.26.x                       |
//! | `numpy 1.26.*`          | 1.26 or any 1.26.x                       |
//! | `numpy >=1.20,<2`       | both bounds                              |
//! | `numpy 1.20.*\|1.22.*`  | either prefix                            |
//! | `numpy 1.26.4 py311*`   | exactly 1.26.4, build matching `py311*`  |
//! | `numpy=1.26.4=py311_0`  | exactly 1.26.4, build `py311_0`          |
//! | `conda-forge::numpy`    | any version, only from `conda-forge`     |

use std::fmt;
use std::str::FromStr;

use glob::Pattern;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::index::PackageCandidate;
use crate::version::Version;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./matchspec_test.rs"]
mod matchspec_test;

const OPERATOR_CHARS: &[char] = &['=', '<', '>', '!', '~'];

/// A constraint over versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Any,
    Exact(Version),
    NotEqual(Version),
    Greater(Version),
    GreaterEqual(Version),
    Less(Version),
    LessEqual(Version),
    /// `=1.2`, `1.2.*`
    StartsWith(Version),
    /// `!=1.2.*`
    NotStartsWith(Version),
    /// `~=1.2.3`, meaning `>=1.2.3` and `1.2.*`
    Compatible(Version),
    All(Vec<VersionSpec>),
    AnyOf(Vec<VersionSpec>),
}

impl VersionSpec {
    /// Parse a version constraint such as `>=1.0,<2|3.*`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::Any);
        }

        let mut alternatives = Vec::new();
        for alternative in s.split('|') {
            let mut parts = Vec::new();
            for atom in alternative.split(',') {
                match parse_atom(atom)? {
                    Self::Any => {}
                    spec => parts.push(spec),
                }
            }
            match parts.len() {
                // one unconstrained alternative makes the whole spec unconstrained
                0 => return Ok(Self::Any),
                1 => alternatives.extend(parts),
                _ => alternatives.push(Self::All(parts)),
            }
        }
        if alternatives.len() == 1 {
            Ok(alternatives.remove(0))
        } else {
            Ok(Self::AnyOf(alternatives))
        }
    }

    /// Whether `version` satisfies this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::NotEqual(v) => version != v,
            Self::Greater(v) => version > v,
            Self::GreaterEqual(v) => version >= v,
            Self::Less(v) => version < v,
            Self::LessEqual(v) => version <= v,
            Self::StartsWith(v) => version.starts_with(v),
            Self::NotStartsWith(v) => !version.starts_with(v),
            Self::Compatible(v) => version >= v && version.starts_with(&compatible_prefix(v)),
            Self::All(specs) => specs.iter().all(|s| s.matches(version)),
            Self::AnyOf(specs) => specs.iter().any(|s| s.matches(version)),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

fn compatible_prefix(v: &Version) -> Version {
    let text = v.as_str();
    match text.rsplit_once('.') {
        Some((prefix, _)) => Version::parse(prefix).unwrap_or_else(|_| v.clone()),
        None => v.clone(),
    }
}

fn parse_atom(atom: &str) -> Result<VersionSpec> {
    let atom = atom.trim();
    if atom.is_empty() {
        return Err(Error::malformed("empty version constraint"));
    }
    if atom == "*" {
        return Ok(VersionSpec::Any);
    }

    let (op, rest) = split_operator(atom);
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(Error::malformed(format!(
            "operator '{op}' without a version in '{atom}'"
        )));
    }
    let (wildcard, bare) = match rest.strip_suffix(".*").or_else(|| rest.strip_suffix('*')) {
        Some(bare) => (true, bare),
        None => (false, rest),
    };
    if bare.is_empty() {
        return Ok(VersionSpec::Any);
    }
    let version = Version::parse(bare)?;

    let spec = match (op, wildcard) {
        ("", false) | ("==", false) => VersionSpec::Exact(version),
        ("", true) | ("=", _) | ("==", true) => VersionSpec::StartsWith(version),
        ("!=", false) => VersionSpec::NotEqual(version),
        ("!=", true) => VersionSpec::NotStartsWith(version),
        (">", _) => VersionSpec::Greater(version),
        (">=", _) => VersionSpec::GreaterEqual(version),
        ("<", _) => VersionSpec::Less(version),
        ("<=", _) => VersionSpec::LessEqual(version),
        ("~=", _) => VersionSpec::Compatible(version),
        (other, _) => {
            return Err(Error::malformed(format!(
                "unknown operator '{other}' in '{atom}'"
            )));
        }
    };
    Ok(spec)
}

fn split_operator(atom: &str) -> (&str, &str) {
    let end = atom
        .char_indices()
        .find(|(_, c)| !OPERATOR_CHARS.contains(c))
        .map_or(atom.len(), |(i, _)| i);
    atom.split_at(end)
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(v) => write!(f, "=={v}"),
            Self::NotEqual(v) => write!(f, "!={v}"),
            Self::Greater(v) => write!(f, ">{v}"),
            Self::GreaterEqual(v) => write!(f, ">={v}"),
            Self::Less(v) => write!(f, "<{v}"),
            Self::LessEqual(v) => write!(f, "<={v}"),
            Self::StartsWith(v) => write!(f, "{v}.*"),
            Self::NotStartsWith(v) => write!(f, "!={v}.*"),
            Self::Compatible(v) => write!(f, "~={v}"),
            Self::All(specs) => write_joined(f, specs, ","),
            Self::AnyOf(specs) => write_joined(f, specs, "|"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, specs: &[VersionSpec], sep: &str) -> fmt::Result {
    for (i, spec) in specs.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{spec}")?;
    }
    Ok(())
}

/// A single parsed requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSpec {
    pub name: String,
    pub channel: Option<String>,
    pub version: VersionSpec,
    /// Glob over the build string.
    pub build: Option<Pattern>,
}

impl MatchSpec {
    /// A requirement that accepts any version of `name`.
    pub fn any<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into().to_lowercase(),
            channel: None,
            version: VersionSpec::Any,
            build: None,
        }
    }

    /// Parse a requirement string.
    pub fn parse(s: &str) -> Result<Self> {
        let input = s.trim();
        if input.is_empty() {
            return Err(Error::malformed("empty requirement"));
        }

        let (channel, rest) = match input.split_once("::") {
            Some((c, r)) => {
                let c = c.trim().trim_end_matches('/');
                if c.is_empty() {
                    return Err(Error::malformed(format!("empty channel in '{input}'")));
                }
                (Some(c.to_string()), r.trim())
            }
            None => (None, input),
        };

        let name_end = rest
            .char_indices()
            .find(|(_, c)| !is_name_char(*c))
            .map_or(rest.len(), |(i, _)| i);
        let (name, remainder) = rest.split_at(name_end);
        if name.is_empty() {
            return Err(Error::malformed(format!("missing package name in '{input}'")));
        }
        let name = name.to_lowercase();
        let remainder = remainder.trim();

        let (version, build) = if remainder.is_empty() {
            (VersionSpec::Any, None)
        } else if let Some(pinned) = equals_pinned(remainder) {
            // name=version=build
            let (v, b) = pinned;
            (VersionSpec::Exact(Version::parse(v)?), Some(b.to_string()))
        } else {
            let tokens = merge_tokens(remainder);
            match tokens.as_slice() {
                [version] => (VersionSpec::parse(version)?, None),
                [version, build] => (VersionSpec::parse(version)?, Some(build.clone())),
                _ => {
                    return Err(Error::malformed(format!(
                        "unexpected trailing text in requirement '{input}'"
                    )));
                }
            }
        };

        let build = match build.filter(|b| b != "*") {
            Some(b) if b.contains(OPERATOR_CHARS) => {
                return Err(Error::malformed(format!("invalid build string in '{input}'")));
            }
            Some(b) => Some(Pattern::new(&b).map_err(|e| {
                Error::malformed(format!("invalid build pattern '{b}' in '{input}': {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            name,
            channel,
            version,
            build,
        })
    }

    /// Whether a candidate satisfies this requirement.
    pub fn matches(&self, candidate: &PackageCandidate) -> bool {
        candidate.name == self.name
            && self
                .channel
                .as_ref()
                .is_none_or(|c| *c == candidate.channel)
            && self.version.matches(&candidate.version)
            && self
                .build
                .as_ref()
                .is_none_or(|pattern| pattern.matches(&candidate.build))
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Recognize the `=version=build` shorthand.
fn equals_pinned(remainder: &str) -> Option<(&str, &str)> {
    let body = remainder.strip_prefix('=')?;
    if body.starts_with('=') || body.contains(char::is_whitespace) {
        return None;
    }
    let (version, build) = body.split_once('=')?;
    if version.is_empty() || build.is_empty() || build.contains('=') {
        return None;
    }
    Some((version, build))
}

/// Split the text after the name into a version token and an optional
/// build token, gluing operators and separators that were spaced out
/// (`>= 1.0, < 2` becomes `>=1.0,<2`).
fn merge_tokens(remainder: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut glue = false;
    for raw in remainder.split_whitespace() {
        let joined = glue || raw.starts_with([',', '|']);
        glue = raw.ends_with([',', '|']) || raw.chars().all(|c| OPERATOR_CHARS.contains(&c));
        if joined {
            if let Some(last) = tokens.last_mut() {
                last.push_str(raw);
                continue;
            }
        }
        tokens.push(raw.to_string());
    }
    tokens
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{channel}::")?;
        }
        f.write_str(&self.name)?;
        if !self.version.is_any() || self.build.is_some() {
            write!(f, " {}", self.version)?;
        }
        if let Some(build) = &self.build {
            write!(f, " {}", build.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for MatchSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for MatchSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MatchSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MatchSpec::parse(&s).map_err(serde::de::Error::custom)
    }
}
