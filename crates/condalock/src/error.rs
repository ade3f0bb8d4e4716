// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for create-lock operations.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience Result type with condalock Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, resolving or locking an environment.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// The environment file could not be parsed into requirement entries
    #[error("Malformed environment spec {}: {message}", display_path(.path))]
    #[diagnostic(
        code(create_lock::malformed_spec),
        help("Check the YAML syntax and the requirement strings under 'dependencies:'")
    )]
    MalformedSpec {
        path: Option<PathBuf>,
        message: String,
    },

    /// A channel named by the environment is not recognized
    #[error("Unknown channel '{channel}'")]
    #[diagnostic(
        code(create_lock::unknown_source),
        help("{}", suggestion_message(known))
    )]
    UnknownSource { channel: String, known: Vec<String> },

    /// The package metadata behind a channel could not be read
    #[error("Channel '{channel}' is unavailable for {subdir}: {reason}")]
    #[diagnostic(
        code(create_lock::source_unavailable),
        help("This is usually transient; retry once the channel metadata is reachable")
    )]
    SourceUnavailable {
        channel: String,
        subdir: String,
        reason: String,
    },

    /// Two requirements on the same package cannot both hold
    #[error(
        "Conflicting requirements for '{package}': {pinned} (required by {}) \
         pins {pinned_version}, which does not satisfy {rejected} (required by {})",
        .pinned_chain.join(" -> "),
        .rejected_chain.join(" -> ")
    )]
    #[diagnostic(
        code(create_lock::version_conflict),
        help("Relax one of the two requirements so their version ranges overlap")
    )]
    VersionConflict {
        package: String,
        pinned: String,
        pinned_version: String,
        pinned_chain: Vec<String>,
        rejected: String,
        rejected_chain: Vec<String>,
    },

    /// No candidate in the index satisfies a requirement
    #[error("No candidate satisfies '{requirement}' (required by {})", .chain.join(" -> "))]
    #[diagnostic(
        code(create_lock::unsatisfiable),
        help("{}", available_message(available))
    )]
    Unsatisfiable {
        requirement: String,
        chain: Vec<String>,
        available: Vec<String>,
    },

    /// Internal invariant violation: the lock writer got an unfinished resolution
    #[error("Resolution is incomplete: {0}")]
    #[diagnostic(code(create_lock::incomplete_resolution))]
    IncompleteResolution(String),

    /// An existing lock file could not be parsed
    #[error("Invalid lock file {path:?}: {message}")]
    #[diagnostic(
        code(create_lock::malformed_lock),
        help("Remove the lock file and run create-lock again")
    )]
    MalformedLock { path: PathBuf, message: String },

    /// Lock serialization error
    #[error("Failed to serialize lock file")]
    #[diagnostic(code(create_lock::serialize))]
    Serialize(#[from] serde_yaml::Error),

    /// Another writer holds the target lock file
    #[error("Another create-lock run is writing {0:?}")]
    #[diagnostic(
        code(create_lock::concurrent_write),
        help("Wait for the other run to finish, or pick a different output path")
    )]
    ConcurrentWrite(PathBuf),

    /// The solver hit its configured decision budget
    #[error("Search budget exhausted after {0} decisions")]
    #[diagnostic(
        code(create_lock::search_budget_exceeded),
        help("Tighten the requirements or raise the budget with --max-decisions")
    )]
    SearchBudgetExceeded(u64),

    /// The run was interrupted or timed out
    #[error("Resolution cancelled: {0}")]
    #[diagnostic(code(create_lock::cancelled))]
    Cancelled(String),

    /// Configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(create_lock::config))]
    Config(#[from] config::ConfigError),

    /// Failed to read file
    #[error("Failed to read file: {path:?}")]
    #[diagnostic(code(create_lock::read_failed))]
    ReadFailed {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// IO error passthrough
    #[error(transparent)]
    #[diagnostic(code(create_lock::io_error))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::MalformedSpec`] that is not tied to a file yet.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedSpec {
            path: None,
            message: message.into(),
        }
    }

    /// Whether retrying the same run may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::ConcurrentWrite(_)
        )
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!("{}", p.display()),
        None => "<input>".to_string(),
    }
}

fn suggestion_message(known: &[String]) -> String {
    if known.is_empty() {
        "Use a channel URL, a local directory, or configure an alias".to_string()
    } else {
        format!("Known channels: {}", known.join(", "))
    }
}

fn available_message(available: &[String]) -> String {
    if available.is_empty() {
        "The package was not found in any enabled channel for this platform".to_string()
    } else {
        format!("Available versions: {}", available.join(", "))
    }
}
