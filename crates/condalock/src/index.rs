// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Candidate index: the catalog of installable package builds.
//!
//! The resolver only sees the [`CandidateIndex`] trait. [`InMemoryIndex`]
//! serves fixed fixtures, [`RepodataIndex`] reads conda `repodata.json`
//! files and [`CachedIndex`] memoizes any index so that several runs can
//! share it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;

use crate::channel::{Channel, ChannelLocation};
use crate::matchspec::MatchSpec;
use crate::platform::Platform;
use crate::version::Version;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./index_test.rs"]
mod index_test;

/// Name of the per-subdir metadata file in a channel.
pub const REPODATA_FILENAME: &str = "repodata.json";

/// Channel name reported for virtual packages.
pub const VIRTUAL_CHANNEL: &str = "@virtual";

/// One concrete build of a package offered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCandidate {
    pub name: String,
    pub version: Version,
    pub build: String,
    pub build_number: u64,
    pub subdir: Platform,
    pub channel: String,
    /// Position of `channel` in the environment's channel list; lower wins ties.
    pub channel_priority: usize,
    pub depends: Vec<MatchSpec>,
    pub sha256: Option<String>,
    pub url: String,
    pub filename: String,
}

impl PackageCandidate {
    /// A `noarch` candidate with an empty build string and no dependencies.
    pub fn new(name: &str, version: &str) -> Result<Self> {
        let name = name.to_lowercase();
        let version = Version::parse(version)?;
        let mut candidate = Self {
            filename: String::new(),
            url: String::new(),
            name,
            version,
            build: "0".to_string(),
            build_number: 0,
            subdir: Platform::NoArch,
            channel: "local".to_string(),
            channel_priority: 0,
            depends: Vec::new(),
            sha256: None,
        };
        candidate.refresh_location();
        Ok(candidate)
    }

    pub fn with_build<S: Into<String>>(mut self, build: S, build_number: u64) -> Self {
        self.build = build.into();
        self.build_number = build_number;
        self.refresh_location();
        self
    }

    pub fn with_subdir(mut self, subdir: Platform) -> Self {
        self.subdir = subdir;
        self.refresh_location();
        self
    }

    pub fn with_channel<S: Into<String>>(mut self, channel: S, priority: usize) -> Self {
        self.channel = channel.into();
        self.channel_priority = priority;
        self.refresh_location();
        self
    }

    pub fn with_depends<I, S>(mut self, depends: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.depends = depends
            .into_iter()
            .map(|d| MatchSpec::parse(d.as_ref()))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn with_sha256<S: Into<String>>(mut self, sha256: S) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    fn refresh_location(&mut self) {
        self.filename = format!("{}-{}-{}.conda", self.name, self.version, self.build);
        self.url = format!("{}/{}/{}", self.channel, self.subdir, self.filename);
    }
}

impl fmt::Display for PackageCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.version, self.build)
    }
}

/// Deterministic preference order: newest version first, then exact
/// platform over `noarch`, then the channel listed earliest, then higher
/// build number, then build string.
pub fn compare_candidates(a: &PackageCandidate, b: &PackageCandidate, target: Platform) -> Ordering {
    b.version
        .cmp(&a.version)
        .then_with(|| (a.subdir != target).cmp(&(b.subdir != target)))
        .then_with(|| a.channel_priority.cmp(&b.channel_priority))
        .then_with(|| b.build_number.cmp(&a.build_number))
        .then_with(|| b.build.cmp(&a.build))
        .then_with(|| a.filename.cmp(&b.filename))
        .then_with(|| a.url.cmp(&b.url))
}

/// Sort candidates by [`compare_candidates`].
pub fn sort_candidates(candidates: &mut [PackageCandidate], target: Platform) {
    candidates.sort_by(|a, b| compare_candidates(a, b, target));
}

/// Queryable catalog of package candidates.
pub trait CandidateIndex: Send + Sync {
    /// All candidates named `name` installable on `platform`, newest first.
    ///
    /// Returns [`Error::SourceUnavailable`] when a backing source cannot
    /// be read; an empty list means the package does not exist.
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>>;
}

impl<T: CandidateIndex + ?Sized> CandidateIndex for Arc<T> {
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        (**self).query(name, platform)
    }
}

impl<T: CandidateIndex + ?Sized> CandidateIndex for &T {
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        (**self).query(name, platform)
    }
}

/// A fixed set of candidates held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    packages: BTreeMap<String, Vec<PackageCandidate>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, candidate: PackageCandidate) {
        self.packages
            .entry(candidate.name.clone())
            .or_default()
            .push(candidate);
    }

    pub fn with(mut self, candidate: PackageCandidate) -> Self {
        self.add(candidate);
        self
    }

    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl CandidateIndex for InMemoryIndex {
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        let mut found: Vec<PackageCandidate> = self
            .packages
            .get(name)
            .into_iter()
            .flatten()
            .filter(|c| c.subdir.is_compatible_with(&platform))
            .cloned()
            .collect();
        sort_candidates(&mut found, platform);
        Ok(found)
    }
}

/// A single package record of a `repodata.json` file.
#[derive(Debug, Clone, Deserialize)]
struct RepodataRecord {
    name: String,
    version: String,
    #[serde(default)]
    build: String,
    #[serde(default)]
    build_number: u64,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RepodataFile {
    #[serde(default)]
    packages: BTreeMap<String, RepodataRecord>,
    #[serde(default, rename = "packages.conda")]
    conda_packages: BTreeMap<String, RepodataRecord>,
}

/// Candidates of one channel subdir, grouped by package name.
type SubdirPackages = HashMap<String, Vec<PackageCandidate>>;

/// Reads candidates from conda `repodata.json` files.
///
/// Local channels (`file://`) are read in place. Remote channels are read
/// from `<cache_dir>/<channel>/<subdir>/repodata.json`, which must have
/// been populated beforehand.
///
/// Names starting with `__` are answered by its [`VirtualPackages`]
/// without reading any channel.
#[derive(Debug)]
pub struct RepodataIndex {
    channels: Vec<Channel>,
    cache_dir: PathBuf,
    virtual_packages: VirtualPackages,
    loaded: DashMap<(usize, Platform), Arc<SubdirPackages>>,
}

impl RepodataIndex {
    pub fn new<P: Into<PathBuf>>(channels: Vec<Channel>, cache_dir: P) -> Self {
        Self {
            channels,
            cache_dir: cache_dir.into(),
            virtual_packages: VirtualPackages::default(),
            loaded: DashMap::new(),
        }
    }

    pub fn with_virtual_packages(mut self, virtual_packages: VirtualPackages) -> Self {
        self.virtual_packages = virtual_packages;
        self
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn channel_root(&self, channel: &Channel) -> PathBuf {
        match channel.location() {
            ChannelLocation::Local(path) => path,
            ChannelLocation::Remote(_) => self.cache_dir.join(channel.cache_key()),
        }
    }

    /// Load one subdir of one channel. `Ok(None)` means the channel exists
    /// but does not publish that subdir.
    fn load_subdir(&self, priority: usize, subdir: Platform) -> Result<Option<Arc<SubdirPackages>>> {
        if let Some(hit) = self.loaded.get(&(priority, subdir)) {
            return Ok(Some(Arc::clone(hit.value())));
        }

        let channel = &self.channels[priority];
        let root = self.channel_root(channel);
        if !root.is_dir() {
            return Err(Error::SourceUnavailable {
                channel: channel.name.clone(),
                subdir: subdir.to_string(),
                reason: format!("no channel metadata at {}", root.display()),
            });
        }

        let path = root.join(subdir.as_str()).join(REPODATA_FILENAME);
        if !path.is_file() {
            tracing::debug!(channel = %channel.name, %subdir, "subdir not published");
            return Ok(None);
        }

        let packages = Arc::new(read_repodata(&path, channel, priority, subdir)?);
        tracing::debug!(
            channel = %channel.name,
            %subdir,
            names = packages.len(),
            "loaded repodata"
        );
        self.loaded.insert((priority, subdir), Arc::clone(&packages));
        Ok(Some(packages))
    }
}

fn read_repodata(
    path: &Path,
    channel: &Channel,
    priority: usize,
    subdir: Platform,
) -> Result<SubdirPackages> {
    let unavailable = |reason: String| Error::SourceUnavailable {
        channel: channel.name.clone(),
        subdir: subdir.to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| unavailable(format!("failed to read {}: {e}", path.display())))?;
    let repodata: RepodataFile = serde_json::from_str(&content)
        .map_err(|e| unavailable(format!("invalid {}: {e}", path.display())))?;

    // the same build is often published in both formats; keep the .conda one
    let mut records: BTreeMap<(String, String, String), (String, RepodataRecord)> =
        BTreeMap::new();
    for (filename, record) in repodata.packages.into_iter().chain(repodata.conda_packages) {
        let key = (
            record.name.to_lowercase(),
            record.version.clone(),
            record.build.clone(),
        );
        match records.get(&key) {
            Some((existing, _)) if existing.ends_with(".conda") => {}
            _ => {
                records.insert(key, (filename, record));
            }
        }
    }

    let mut packages = SubdirPackages::new();
    for (filename, record) in records.into_values() {
        match candidate_from_record(filename, record, channel, priority, subdir) {
            Ok(candidate) => packages
                .entry(candidate.name.clone())
                .or_default()
                .push(candidate),
            Err(err) => {
                tracing::warn!(channel = %channel.name, %subdir, "skipping record: {err}");
            }
        }
    }
    Ok(packages)
}

fn candidate_from_record(
    filename: String,
    record: RepodataRecord,
    channel: &Channel,
    priority: usize,
    subdir: Platform,
) -> Result<PackageCandidate> {
    let depends = record
        .depends
        .iter()
        .map(|d| MatchSpec::parse(d))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::malformed(format!("{filename}: {e}")))?;
    Ok(PackageCandidate {
        name: record.name.to_lowercase(),
        version: Version::parse(&record.version)
            .map_err(|e| Error::malformed(format!("{filename}: {e}")))?,
        build: record.build,
        build_number: record.build_number,
        subdir,
        channel: channel.name.clone(),
        channel_priority: priority,
        depends,
        sha256: record.sha256,
        url: format!("{}/{}/{}", channel.url, subdir, filename),
        filename,
    })
}

impl CandidateIndex for RepodataIndex {
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        if VirtualPackages::is_virtual(name) {
            return self.virtual_packages.query(name, platform);
        }
        let mut found = Vec::new();
        for priority in 0..self.channels.len() {
            let mut published = false;
            for subdir in platform.subdirs() {
                if let Some(packages) = self.load_subdir(priority, subdir)? {
                    published = true;
                    found.extend(packages.get(name).into_iter().flatten().cloned());
                }
            }
            if !published {
                return Err(Error::SourceUnavailable {
                    channel: self.channels[priority].name.clone(),
                    subdir: platform.to_string(),
                    reason: "channel publishes neither the target subdir nor noarch".to_string(),
                });
            }
        }
        sort_candidates(&mut found, platform);
        Ok(found)
    }
}

/// Host capabilities such as `__glibc` or `__unix`, which packages depend
/// on but no channel publishes.
///
/// Each platform has a default set (see [`Platform::virtual_packages`]).
/// Overrides map a name to a version; an empty version hides the package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualPackages {
    overrides: BTreeMap<String, String>,
}

impl VirtualPackages {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn is_virtual(name: &str) -> bool {
        name.starts_with("__")
    }

    /// The virtual package `name` as seen on `platform`, if it exists there.
    pub fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        let version = match self.overrides.get(name) {
            Some(version) => version.trim(),
            None => platform
                .virtual_packages()
                .iter()
                .find(|(n, _)| *n == name)
                .map_or("", |(_, v)| *v),
        };
        if version.is_empty() {
            return Ok(Vec::new());
        }
        let candidate = PackageCandidate::new(name, version)
            .map_err(|e| Error::malformed(format!("virtual package {name}: {e}")))?
            .with_channel(VIRTUAL_CHANNEL, 0)
            .with_subdir(platform);
        Ok(vec![candidate])
    }
}

/// Memoizes the results of another index.
///
/// Errors are not cached, so a source that was unavailable is asked again
/// on the next query.
#[derive(Debug)]
pub struct CachedIndex<I> {
    inner: I,
    results: DashMap<(String, Platform), Arc<Vec<PackageCandidate>>>,
}

impl<I: CandidateIndex> CachedIndex<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            results: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<I: CandidateIndex> CandidateIndex for CachedIndex<I> {
    fn query(&self, name: &str, platform: Platform) -> Result<Vec<PackageCandidate>> {
        let key = (name.to_string(), platform);
        if let Some(hit) = self.results.get(&key) {
            return Ok(hit.value().as_ref().clone());
        }
        let found = Arc::new(self.inner.query(name, platform)?);
        self.results.insert(key, Arc::clone(&found));
        Ok(found.as_ref().clone())
    }
}
