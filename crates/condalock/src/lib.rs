// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! condalock - reproducible lock files for conda environments
//!
//! Turns an `environment.yml` into a lock file that pins exactly one build
//! of every package the environment needs.
//!
//! # Overview
//!
//! A run goes through four stages:
//!
//! 1. [`SpecLoader`] parses the environment file and normalizes channels.
//! 2. A [`CandidateIndex`] lists the builds each channel offers.
//! 3. [`Resolver`] searches, with backtracking, for one build per package
//!    that satisfies every requirement and dependency.
//! 4. [`LockWriter`] writes the pins atomically.
//!
//! # Example
//!
//! ```yaml
//! # environment.yml
//! name: demo
//! channels:
//!   - conda-forge
//! platform: linux-64
//! dependencies:
//!   - python >=3.11
//!   - numpy=1.26
//! ```

use std::path::Path;

pub mod channel;
pub mod config;
pub mod error;
pub mod index;
pub mod lock;
pub mod matchspec;
pub mod platform;
pub mod resolver;
pub mod spec;
pub mod version;

pub use channel::{Channel, ChannelLocation, ChannelRegistry};
pub use config::Config;
pub use error::{Error, Result};
pub use index::{
    CachedIndex, CandidateIndex, InMemoryIndex, PackageCandidate, RepodataIndex, VirtualPackages,
};
pub use lock::{
    LockChange, LockChangeKind, LockEntry, LockFile, LockWriter, PackageChange, WriteGuard,
};
pub use matchspec::{MatchSpec, VersionSpec};
pub use platform::Platform;
pub use resolver::{ResolutionState, Resolver, ResolverOptions};
pub use spec::{EnvironmentSpec, SpecLoader};
pub use version::Version;

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

/// Version of this crate, written into every lock file.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Target platform when neither the environment file nor the config name one.
pub const DEFAULT_PLATFORM: Platform = Platform::EmscriptenWasm32;

/// Conventional lock file name next to an `environment.yml`.
pub const LOCK_FILENAME: &str = "environment.lock.yaml";

/// Resolve `spec` against `index` and write the result to `target`.
///
/// Builds pinned by `previous`, usually the lock being replaced, are kept
/// wherever they still satisfy the environment. Nothing is written when
/// any stage fails.
pub fn create_lock<I: CandidateIndex>(
    spec: &EnvironmentSpec,
    index: I,
    options: ResolverOptions,
    previous: Option<&LockFile>,
    target: &Path,
) -> Result<LockFile> {
    let state = Resolver::new(index)
        .with_options(options)
        .with_previous_lock(previous)
        .resolve(spec)?;
    LockWriter::new().write(spec, &state, target)
}
