// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Target platforms (conda subdirs).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./platform_test.rs"]
mod platform_test;

/// A conda subdir such as `linux-64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    NoArch,
    Linux64,
    LinuxAarch64,
    Osx64,
    OsxArm64,
    Win64,
    EmscriptenWasm32,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::NoArch,
        Platform::Linux64,
        Platform::LinuxAarch64,
        Platform::Osx64,
        Platform::OsxArm64,
        Platform::Win64,
        Platform::EmscriptenWasm32,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::NoArch => "noarch",
            Platform::Linux64 => "linux-64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::Osx64 => "osx-64",
            Platform::OsxArm64 => "osx-arm64",
            Platform::Win64 => "win-64",
            Platform::EmscriptenWasm32 => "emscripten-wasm32",
        }
    }

    /// Subdirs searched for this target, exact match first.
    pub fn subdirs(&self) -> Vec<Platform> {
        match self {
            Platform::NoArch => vec![Platform::NoArch],
            other => vec![*other, Platform::NoArch],
        }
    }

    /// Virtual packages a host of this platform provides, as name and version.
    pub fn virtual_packages(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Platform::NoArch => &[],
            Platform::Linux64 | Platform::LinuxAarch64 => {
                &[("__glibc", "2.17"), ("__linux", "0"), ("__unix", "0")]
            }
            Platform::Osx64 => &[("__osx", "10.15"), ("__unix", "0")],
            Platform::OsxArm64 => &[("__osx", "11.0"), ("__unix", "0")],
            Platform::Win64 => &[("__win", "0")],
            Platform::EmscriptenWasm32 => &[("__emscripten", "0"), ("__unix", "0")],
        }
    }

    /// Whether packages built for `self` can be installed on `target`.
    pub fn is_compatible_with(&self, target: &Platform) -> bool {
        self == target || *self == Platform::NoArch
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(Platform::as_str).collect();
                Error::malformed(format!(
                    "unknown platform '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
