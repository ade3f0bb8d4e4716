// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Conda-style package versions and their total ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./version_test.rs"]
mod version_test;

/// One comparable piece of a version segment.
///
/// `1.0rc1` splits into segments `1` and `0rc1`, and the second one into
/// the components `0`, `rc`, `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Number(u64),
    Text(String),
}

impl Component {
    fn rank(&self) -> u8 {
        match self {
            // pre-release markers sort before plain numbers
            Component::Text(t) if t == "dev" => 0,
            Component::Text(t) if t != "post" => 1,
            Component::Number(_) => 2,
            Component::Text(_) => 3,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Number(a), Component::Number(b)) => a.cmp(b),
            (Component::Text(a), Component::Text(b)) if self.rank() == other.rank() => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed package version such as `1.26.4`, `2.0`, `1.0rc1` or `1!2.0`.
///
/// Segments compare numerically when numeric and lexically otherwise.
/// Missing trailing segments compare as zero, so `2.0` and `2.0.0` are equal.
#[derive(Debug, Clone)]
pub struct Version {
    source: String,
    epoch: u64,
    segments: Vec<Vec<Component>>,
    local: Vec<Vec<Component>>,
}

impl Version {
    /// Parse a version string.
    pub fn parse(s: &str) -> Result<Self> {
        let source = s.trim();
        if source.is_empty() {
            return Err(Error::malformed("empty version"));
        }
        if source.contains(char::is_whitespace) {
            return Err(Error::malformed(format!("invalid version '{source}'")));
        }

        let lowered = source.to_lowercase();
        let (epoch, rest) = match lowered.split_once('!') {
            Some((e, r)) => {
                let epoch = e
                    .parse::<u64>()
                    .map_err(|_| Error::malformed(format!("invalid epoch in version '{source}'")))?;
                (epoch, r.to_string())
            }
            None => (0, lowered),
        };

        let (public, local) = match rest.split_once('+') {
            Some((p, l)) => (p.to_string(), Some(l.to_string())),
            None => (rest, None),
        };

        let segments = parse_segments(&public, source)?;
        let local = match local {
            Some(l) => parse_segments(&l, source)?,
            None => Vec::new(),
        };

        Ok(Self {
            source: source.to_string(),
            epoch,
            segments,
            local,
        })
    }

    /// The version string as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `self` starts with all segments of `prefix`.
    ///
    /// `1.2.5` starts with `1.2`; `1.20` does not.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        if self.epoch != prefix.epoch || prefix.segments.len() > self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(prefix.segments.iter())
            .all(|(a, b)| a == b)
    }
}

fn parse_segments(s: &str, source: &str) -> Result<Vec<Vec<Component>>> {
    let mut segments = Vec::new();
    for segment in s.split(['.', '-', '_']) {
        if segment.is_empty() {
            return Err(Error::malformed(format!("invalid version '{source}'")));
        }
        segments.push(parse_components(segment, source)?);
    }
    Ok(segments)
}

fn parse_components(segment: &str, source: &str) -> Result<Vec<Component>> {
    let mut components = Vec::new();
    let mut chars = segment.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(d);
                chars.next();
            }
            let n = digits
                .parse::<u64>()
                .map_err(|_| Error::malformed(format!("version number too large in '{source}'")))?;
            components.push(Component::Number(n));
        } else if c.is_ascii_alphabetic() {
            let mut text = String::new();
            while let Some(&a) = chars.peek().filter(|a| a.is_ascii_alphabetic()) {
                text.push(a);
                chars.next();
            }
            components.push(Component::Text(text));
        } else {
            return Err(Error::malformed(format!(
                "invalid character '{c}' in version '{source}'"
            )));
        }
    }
    // a segment starting with letters ("rc1") sorts as "0rc1"
    if matches!(components.first(), Some(Component::Text(_))) {
        components.insert(0, Component::Number(0));
    }
    Ok(components)
}

fn compare_segments(a: &[Vec<Component>], b: &[Vec<Component>]) -> Ordering {
    let zero = vec![Component::Number(0)];
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).unwrap_or(&zero);
        let right = b.get(i).unwrap_or(&zero);
        let width = left.len().max(right.len());
        for j in 0..width {
            let ord = match (left.get(j), right.get(j)) {
                (Some(l), Some(r)) => l.cmp(r),
                (Some(l), None) => l.cmp(&Component::Number(0)),
                (None, Some(r)) => Component::Number(0).cmp(r),
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_segments(&self.segments, &other.segments))
            .then_with(|| compare_segments(&self.local, &other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // equal versions may differ in trailing zeros, so only the
        // normalized leading part participates
        self.epoch.hash(state);
        let significant = self
            .segments
            .iter()
            .rposition(|s| s.as_slice() != [Component::Number(0)])
            .map_or(0, |i| i + 1);
        significant.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
