// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Lock file structures and the atomic lock writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::index::{PackageCandidate, VirtualPackages};
use crate::matchspec::MatchSpec;
use crate::platform::Platform;
use crate::resolver::ResolutionState;
use crate::spec::EnvironmentSpec;
use crate::version::Version;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./lock_test.rs"]
mod lock_test;

/// Lock file format version.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum LockVersion {
    #[serde(rename = "1.0.0")]
    V1,
}

/// A fully pinned environment.
///
/// Contains no timestamps or host details, so resolving an unchanged spec
/// against an unchanged index serializes to identical bytes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockFile {
    pub lock_version: LockVersion,
    pub generator: String,
    pub platform: Platform,
    /// [`EnvironmentSpec::fingerprint`] of the environment this was made from.
    pub spec_fingerprint: String,
    /// Requirements of the environment, as written.
    pub specs: Vec<String>,
    /// Enabled channels in priority order.
    pub channels: Vec<Channel>,
    /// Sorted by name.
    pub packages: Vec<LockEntry>,
}

/// One pinned package.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockEntry {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: u64,
    pub subdir: Platform,
    pub channel: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
}

impl From<&PackageCandidate> for LockEntry {
    fn from(candidate: &PackageCandidate) -> Self {
        Self {
            name: candidate.name.clone(),
            version: candidate.version.to_string(),
            build: candidate.build.clone(),
            build_number: candidate.build_number,
            subdir: candidate.subdir,
            channel: candidate.channel.clone(),
            url: candidate.url.clone(),
            sha256: candidate.sha256.clone(),
            depends: candidate.depends.iter().map(ToString::to_string).collect(),
        }
    }
}

impl LockEntry {
    /// The entry as a candidate, for matching requirements against it.
    fn to_candidate(&self) -> Result<PackageCandidate> {
        Ok(PackageCandidate {
            name: self.name.clone(),
            version: Version::parse(&self.version)?,
            build: self.build.clone(),
            build_number: self.build_number,
            subdir: self.subdir,
            channel: self.channel.clone(),
            channel_priority: 0,
            depends: Vec::new(),
            sha256: self.sha256.clone(),
            url: self.url.clone(),
            filename: self.url.rsplit('/').next().unwrap_or_default().to_string(),
        })
    }
}

/// A single detected difference between a lock and the current spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub kind: LockChangeKind,
    pub expected: String,
    pub actual: String,
}

/// Types of lock mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChangeKind {
    PlatformChanged,
    SpecChanged,
}

/// How one package differs between two locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageChange {
    Added(LockEntry),
    Removed(LockEntry),
    /// Another version, build or channel.
    Changed { from: LockEntry, to: LockEntry },
}

impl PackageChange {
    pub fn name(&self) -> &str {
        match self {
            Self::Added(entry) | Self::Removed(entry) => &entry.name,
            Self::Changed { to, .. } => &to.name,
        }
    }
}

/// The `generator` value written by this build.
pub fn generator() -> String {
    format!("create-lock {}", crate::VERSION)
}

impl LockFile {
    /// Build a lock from a finished resolution of `spec`.
    ///
    /// Fails with [`Error::IncompleteResolution`] unless every requirement
    /// is satisfied and the pins are closed under their dependencies.
    pub fn from_resolution(spec: &EnvironmentSpec, state: &ResolutionState) -> Result<Self> {
        if !state.is_complete() {
            let unsatisfied: Vec<String> =
                state.unsatisfied.iter().map(|r| r.spec.to_string()).collect();
            return Err(Error::IncompleteResolution(format!(
                "unsatisfied requirements: {}",
                unsatisfied.join(", ")
            )));
        }
        if let Some(platform) = state.platform {
            if platform != spec.platform {
                return Err(Error::IncompleteResolution(format!(
                    "resolved for {platform}, but the environment targets {}",
                    spec.platform
                )));
            }
        }
        for requirement in &spec.requirements {
            match state.get(&requirement.name) {
                Some(candidate) if requirement.matches(candidate) => {}
                Some(candidate) => {
                    return Err(Error::IncompleteResolution(format!(
                        "{requirement} is not satisfied by {candidate}"
                    )));
                }
                None => {
                    return Err(Error::IncompleteResolution(format!(
                        "{requirement} has no pinned package"
                    )));
                }
            }
        }

        let lock = Self {
            lock_version: LockVersion::V1,
            generator: generator(),
            platform: spec.platform,
            spec_fingerprint: spec.fingerprint(),
            specs: spec.requirements.iter().map(ToString::to_string).collect(),
            channels: spec.channels.clone(),
            packages: state
                .packages()
                .filter(|c| !VirtualPackages::is_virtual(&c.name))
                .map(LockEntry::from)
                .collect(),
        };
        lock.verify()?;
        Ok(lock)
    }

    /// Check names are unique and sorted, subdirs fit the platform and
    /// every declared dependency is satisfied by another entry. Virtual
    /// packages are host properties and are not locked.
    pub fn verify(&self) -> Result<()> {
        for pair in self.packages.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(Error::IncompleteResolution(format!(
                    "packages are not unique and sorted at '{}'",
                    pair[1].name
                )));
            }
        }

        let mut pinned = Vec::with_capacity(self.packages.len());
        for entry in &self.packages {
            if !entry.subdir.is_compatible_with(&self.platform) {
                return Err(Error::IncompleteResolution(format!(
                    "{} is built for {}, not {}",
                    entry.name, entry.subdir, self.platform
                )));
            }
            pinned.push(entry.to_candidate()?);
        }

        for entry in &self.packages {
            for dep in &entry.depends {
                let dep = MatchSpec::parse(dep)?;
                if VirtualPackages::is_virtual(&dep.name) {
                    continue;
                }
                let satisfied = pinned
                    .binary_search_by(|c| c.name.as_str().cmp(&dep.name))
                    .is_ok_and(|i| dep.matches(&pinned[i]));
                if !satisfied {
                    return Err(Error::IncompleteResolution(format!(
                        "dependency {dep} of {} is not satisfied",
                        entry.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load a lock file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::ReadFailed {
            path: path.to_path_buf(),
            error: e,
        })?;
        serde_yaml::from_str(&yaml).map_err(|e| Error::MalformedLock {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// The lock currently at `path`, if there is a readable one.
    pub fn load_previous<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return None;
        }
        match Self::load(path) {
            Ok(lock) => Some(lock),
            Err(err) => {
                tracing::warn!(path = %path.display(), "ignoring existing lock: {err}");
                None
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.packages
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.packages[i])
    }

    /// Packages that changed since `previous`, sorted by name.
    pub fn diff(&self, previous: &LockFile) -> Vec<PackageChange> {
        let mut changes = Vec::new();
        let mut old = previous.packages.iter().peekable();
        let mut new = self.packages.iter().peekable();
        loop {
            let change = match (old.peek(), new.peek()) {
                (None, None) => break,
                (Some(_), None) => old.next().cloned().map(PackageChange::Removed),
                (None, Some(_)) => new.next().cloned().map(PackageChange::Added),
                (Some(o), Some(n)) => match o.name.cmp(&n.name) {
                    std::cmp::Ordering::Less => old.next().cloned().map(PackageChange::Removed),
                    std::cmp::Ordering::Greater => new.next().cloned().map(PackageChange::Added),
                    std::cmp::Ordering::Equal => {
                        let (from, to) = (*o, *n);
                        old.next();
                        new.next();
                        let moved = from.version != to.version
                            || from.build != to.build
                            || from.channel != to.channel;
                        moved.then(|| PackageChange::Changed {
                            from: from.clone(),
                            to: to.clone(),
                        })
                    }
                },
            };
            changes.extend(change);
        }
        changes
    }

    /// Whether this lock was made from `spec` as it is now.
    pub fn is_current(&self, spec: &EnvironmentSpec) -> bool {
        self.changes(spec).is_empty()
    }

    /// What differs between this lock and `spec`.
    pub fn changes(&self, spec: &EnvironmentSpec) -> Vec<LockChange> {
        let mut changes = Vec::new();
        if self.platform != spec.platform {
            changes.push(LockChange {
                kind: LockChangeKind::PlatformChanged,
                expected: self.platform.to_string(),
                actual: spec.platform.to_string(),
            });
        }
        let fingerprint = spec.fingerprint();
        if self.spec_fingerprint != fingerprint {
            changes.push(LockChange {
                kind: LockChangeKind::SpecChanged,
                expected: self.spec_fingerprint.clone(),
                actual: fingerprint,
            });
        }
        changes
    }
}

/// Writes lock files atomically, one writer per target at a time.
#[derive(Debug, Default, Clone)]
pub struct LockWriter;

impl LockWriter {
    pub fn new() -> Self {
        Self
    }

    /// Serialize the resolution of `spec` to `target`.
    ///
    /// Nothing is written unless the resolution is complete. The target is
    /// replaced in a single rename, so it either keeps its previous content
    /// or holds the whole new lock.
    pub fn write(
        &self,
        spec: &EnvironmentSpec,
        state: &ResolutionState,
        target: &Path,
    ) -> Result<LockFile> {
        let lock = LockFile::from_resolution(spec, state)?;
        let yaml = lock.to_yaml()?;

        let _guard = WriteGuard::acquire(target)?;
        write_atomic(target, |file| file.write_all(yaml.as_bytes()))?;
        tracing::info!(
            path = %target.display(),
            packages = lock.packages.len(),
            "wrote lock file"
        );
        Ok(lock)
    }
}

/// Exclusive claim on a target path, held through a sidecar
/// `.<name>.lck` file next to it.
#[derive(Debug)]
pub struct WriteGuard {
    file: File,
    path: PathBuf,
}

impl WriteGuard {
    /// Claim `target`, failing with [`Error::ConcurrentWrite`] if another
    /// writer holds it.
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = sidecar_path(target)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "acquired writer lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(Error::ConcurrentWrite(target.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "failed to release writer lock: {err}");
        }
    }
}

fn sidecar_path(target: &Path) -> Result<PathBuf> {
    let Some(name) = target.file_name() else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not a file path: {}", target.display()),
        )));
    };
    Ok(target.with_file_name(format!(".{}.lck", name.to_string_lossy())))
}

/// Replace `target` with whatever `write` produces.
///
/// The content goes to a temporary file in the same directory, is synced,
/// then renamed over the target. If `write` fails the temporary file is
/// removed and the target is left untouched.
pub fn write_atomic<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".create-lock")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
