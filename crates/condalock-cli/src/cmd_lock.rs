// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Resolve an environment spec and write its lock file.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Args;
use colored::Colorize;
use condalock::{
    CachedIndex, Config, Error, LockFile, PackageChange, Platform, RepodataIndex, SpecLoader,
};
use miette::{IntoDiagnostic, Result};

#[cfg(test)]
#[path = "./cmd_lock_test.rs"]
mod cmd_lock_test;

/// Exit code of a run stopped by Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Resolve an environment spec into a lock file
#[derive(Debug, Args)]
pub struct CmdLock {
    /// Environment spec to resolve (environment.yml)
    spec: PathBuf,

    /// Lock file to write
    lock: PathBuf,

    /// Target platform, overriding the environment file and the config
    #[clap(long, env = "CREATE_LOCK_PLATFORM")]
    platform: Option<Platform>,

    /// Verify the lock is current instead of writing it
    /// (exit 0 if current, 1 if stale, 2 if missing)
    #[clap(long)]
    check: bool,

    /// Give up after this many seconds of resolution
    #[clap(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Give up after this many solver decisions
    #[clap(long, value_name = "N")]
    max_decisions: Option<u64>,

    /// Additional configuration file
    #[clap(long, env = "CREATE_LOCK_CONFIG")]
    config: Option<PathBuf>,
}

impl CmdLock {
    pub async fn run(&mut self, quiet: bool) -> Result<i32> {
        let config = Config::load(self.config.as_deref())?;
        let loader = SpecLoader::new(config.registry(), config.default_platform)
            .with_platform_override(self.platform);
        let spec = loader.load(&self.spec)?;

        if self.check {
            return self.check_lock(&spec);
        }

        let mut options = config.resolver_options();
        if let Some(max_decisions) = self.max_decisions {
            options = options.with_max_decisions(max_decisions);
        }
        if let Some(secs) = self.timeout {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        let cancel = options.cancel.clone();

        let index = CachedIndex::new(
            RepodataIndex::new(spec.channels.clone(), config.cache_dir())
                .with_virtual_packages(config.virtual_packages()),
        );
        let previous = LockFile::load_previous(&self.lock);
        let target = self.lock.clone();
        let locked = previous.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            condalock::create_lock(&spec, index, options, locked.as_ref(), &target)
        });

        let mut interrupted = false;
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, stopping resolution");
                interrupted = true;
                cancel.store(true, Ordering::Relaxed);
                task.await
            }
        };

        match joined.into_diagnostic()? {
            Ok(lock) => {
                if !quiet {
                    println!(
                        "{} {} ({} packages for {})",
                        "Locked".green(),
                        self.lock.display(),
                        lock.packages.len(),
                        lock.platform
                    );
                    for line in summary(&lock, previous.as_ref()) {
                        println!("{line}");
                    }
                }
                Ok(0)
            }
            Err(err @ Error::Cancelled(_)) if interrupted => {
                eprintln!("{:?}", miette::Report::new(err));
                Ok(EXIT_INTERRUPTED)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn check_lock(&self, spec: &condalock::EnvironmentSpec) -> Result<i32> {
        if !self.lock.exists() {
            eprintln!("No lock file found at {}", self.lock.display());
            return Ok(2);
        }

        let lock = LockFile::load(&self.lock)?;
        let changes = lock.changes(spec);
        if !changes.is_empty() {
            eprintln!("{}", "Lock file is out of date:".yellow());
            for change in &changes {
                eprintln!(
                    "  - {:?}: locked {}, now {}",
                    change.kind, change.expected, change.actual
                );
            }
            return Ok(1);
        }

        println!("Lock file is up to date");
        Ok(0)
    }
}

/// The packages of a fresh lock as a table, or what changed since the
/// lock it replaced.
fn summary(lock: &LockFile, previous: Option<&LockFile>) -> Vec<String> {
    let Some(previous) = previous else {
        let name_width = lock.packages.iter().map(|e| e.name.len()).max().unwrap_or(0);
        let version_width = lock.packages.iter().map(|e| e.version.len()).max().unwrap_or(0);
        let build_width = lock.packages.iter().map(|e| e.build.len()).max().unwrap_or(0);
        return lock
            .packages
            .iter()
            .map(|e| {
                format!(
                    "  {:<name_width$}  {:<version_width$}  {:<build_width$}  {}",
                    e.name, e.version, e.build, e.channel
                )
            })
            .collect();
    };

    let changes = lock.diff(previous);
    if changes.is_empty() {
        return vec![format!("  {}", "No package changes".dimmed())];
    }
    changes
        .iter()
        .map(|change| match change {
            PackageChange::Added(e) => {
                format!("  {} {} {} {} ({})", "+".green(), e.name, e.version, e.build, e.channel)
            }
            PackageChange::Removed(e) => {
                format!("  {} {} {} {}", "-".red(), e.name, e.version, e.build)
            }
            PackageChange::Changed { from, to } => format!(
                "  {} {} {} {} -> {} {} ({})",
                "~".yellow(),
                to.name,
                from.version,
                from.build,
                to.version,
                to.build,
                to.channel
            ),
        })
        .collect()
}
