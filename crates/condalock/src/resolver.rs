// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Backtracking search from requirements to one pinned build per package.
//!
//! Requirements are processed first in, first out. A requirement on a
//! package that is already pinned is only checked against the pin; any
//! other requirement opens a decision point where the matching candidates
//! are tried newest first, each one queuing its own dependencies. When the
//! queue empties the pins are the answer; when a choice leads nowhere it is
//! unpinned and the next candidate is tried.
//!
//! Every failure carries the set of packages whose pins caused it. A
//! decision whose package is not in that set cannot fix the failure, so it
//! is skipped over instead of retried. Sets learned from exhausted decisions
//! are remembered, and any later state that repeats those pins fails
//! without being searched again.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::index::{CandidateIndex, PackageCandidate, sort_candidates};
use crate::lock::LockFile;
use crate::matchspec::MatchSpec;
use crate::platform::Platform;
use crate::spec::EnvironmentSpec;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./resolver_test.rs"]
mod resolver_test;

/// Decision budget used when none is configured.
pub const DEFAULT_MAX_DECISIONS: u64 = 100_000;

/// First link of every requirement chain.
pub const ROOT_REQUESTER: &str = "environment";

/// Limits and cancellation for a single resolution run.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub max_decisions: u64,
    pub deadline: Option<Instant>,
    pub cancel: Arc<AtomicBool>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_decisions: DEFAULT_MAX_DECISIONS,
            deadline: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ResolverOptions {
    pub fn with_max_decisions(mut self, max_decisions: u64) -> Self {
        self.max_decisions = max_decisions;
        self
    }

    /// Give up once `timeout` has passed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A requirement together with the chain of requesters that introduced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub spec: MatchSpec,
    /// `["environment", "b 1.0 0"]` for a dependency declared by `b`.
    pub chain: Vec<String>,
    /// Package that declared the dependency; `None` for the environment.
    pub requester: Option<String>,
}

impl Requirement {
    pub fn root(spec: MatchSpec) -> Self {
        Self {
            spec,
            chain: vec![ROOT_REQUESTER.to_string()],
            requester: None,
        }
    }

    /// A dependency declared by `parent`, which was pinned for `self`.
    fn child(&self, spec: MatchSpec, parent: &PackageCandidate) -> Self {
        let mut chain = self.chain.clone();
        chain.push(parent.to_string());
        Self {
            spec,
            chain,
            requester: Some(parent.name.clone()),
        }
    }

    /// Packages whose pins keep this requirement in play.
    fn culprits(&self) -> BTreeSet<String> {
        self.requester.iter().cloned().collect()
    }
}

/// A chosen candidate and the requirement that selected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub candidate: PackageCandidate,
    pub requested_by: Requirement,
}

/// The result of a resolution run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionState {
    pub platform: Option<Platform>,
    pub pins: BTreeMap<String, Pin>,
    pub unsatisfied: Vec<Requirement>,
}

impl ResolutionState {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            ..Default::default()
        }
    }

    /// Pin a candidate as if the environment had asked for it.
    pub fn pin(&mut self, candidate: PackageCandidate) {
        let requested_by = Requirement::root(MatchSpec::any(&candidate.name));
        self.pins.insert(
            candidate.name.clone(),
            Pin {
                candidate,
                requested_by,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&PackageCandidate> {
        self.pins.get(name).map(|p| &p.candidate)
    }

    /// Pinned candidates sorted by name.
    pub fn packages(&self) -> impl Iterator<Item = &PackageCandidate> {
        self.pins.values().map(|p| &p.candidate)
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.unsatisfied.is_empty()
    }
}

/// Why a branch of the search failed.
#[derive(Debug, Clone)]
enum Failure {
    Conflict {
        pinned: Requirement,
        pinned_version: String,
        rejected: Requirement,
    },
    Missing {
        requirement: Requirement,
        available: Vec<String>,
    },
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Conflict {
                pinned,
                pinned_version,
                rejected,
            } => Error::VersionConflict {
                package: rejected.spec.name.clone(),
                pinned: pinned.spec.to_string(),
                pinned_version,
                pinned_chain: pinned.chain,
                rejected: rejected.spec.to_string(),
                rejected_chain: rejected.chain,
            },
            Failure::Missing {
                requirement,
                available,
            } => Error::Unsatisfiable {
                requirement: requirement.spec.to_string(),
                chain: requirement.chain,
                available,
            },
        }
    }
}

/// A failure and the packages whose current pins are enough to cause it.
/// No solution keeps all of those pins.
#[derive(Debug, Clone)]
struct Dead {
    failure: Failure,
    culprits: BTreeSet<String>,
}

enum Outcome {
    Solved,
    Failed(Dead),
}

/// Pins, as name and url, that no solution contains together.
type Nogood = Vec<(String, String)>;

/// Nogoods learned during one run, looked up by each of their pins.
#[derive(Default)]
struct Memo {
    failures: HashMap<Nogood, Failure>,
    by_pin: HashMap<(String, String), Vec<Nogood>>,
}

impl Memo {
    fn learn(&mut self, nogood: Nogood, failure: &Failure) {
        if nogood.is_empty() || self.failures.contains_key(&nogood) {
            return;
        }
        for pin in &nogood {
            self.by_pin
                .entry(pin.clone())
                .or_default()
                .push(nogood.clone());
        }
        self.failures.insert(nogood, failure.clone());
    }

    /// A remembered failure that the pins, having just pinned `name` to
    /// `url`, run into again.
    fn recall(&self, pins: &BTreeMap<String, Pin>, name: &str, url: &str) -> Option<Dead> {
        let key = (name.to_string(), url.to_string());
        self.by_pin.get(&key)?.iter().find_map(|nogood| {
            let repeated = nogood.iter().all(|(name, url)| {
                pins.get(name)
                    .is_some_and(|pin| pin.candidate.url == *url)
            });
            repeated.then(|| Dead {
                failure: self.failures[nogood].clone(),
                culprits: nogood.iter().map(|(name, _)| name.clone()).collect(),
            })
        })
    }
}

/// Resolves environment specs against a candidate index.
#[derive(Debug, Clone)]
pub struct Resolver<I> {
    index: I,
    options: ResolverOptions,
    /// Builds to try first, by package name, as (version, build, channel).
    preferred: HashMap<String, (String, String, String)>,
    preferred_platform: Option<Platform>,
}

impl<I: CandidateIndex> Resolver<I> {
    pub fn new(index: I) -> Self {
        Self {
            index,
            options: ResolverOptions::default(),
            preferred: HashMap::new(),
            preferred_platform: None,
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Try the builds pinned by `previous` before any other candidate, so
    /// that relocking only moves the packages it has to.
    ///
    /// A lock made for another platform is ignored.
    pub fn with_previous_lock(mut self, previous: Option<&LockFile>) -> Self {
        self.preferred = previous
            .into_iter()
            .flat_map(|lock| {
                lock.packages.iter().map(|entry| {
                    (
                        entry.name.clone(),
                        (entry.version.clone(), entry.build.clone(), entry.channel.clone()),
                    )
                })
            })
            .collect();
        self.preferred_platform = previous.map(|lock| lock.platform);
        self
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Find one candidate per package such that every requirement of the
    /// spec, and every dependency of every chosen candidate, is satisfied.
    pub fn resolve(&self, spec: &EnvironmentSpec) -> Result<ResolutionState> {
        tracing::info!(
            requirements = spec.requirements.len(),
            platform = %spec.platform,
            "resolving environment"
        );
        let preferred = match self.preferred_platform {
            Some(platform) if platform == spec.platform => Some(&self.preferred),
            Some(platform) => {
                tracing::debug!(%platform, "previous lock targets another platform, ignoring it");
                None
            }
            None => None,
        };
        let mut search = Search {
            index: &self.index,
            options: &self.options,
            spec,
            preferred,
            candidates: HashMap::new(),
            memo: Memo::default(),
            decisions: 0,
            pins: BTreeMap::new(),
        };
        let pending = spec
            .requirements
            .iter()
            .cloned()
            .map(Requirement::root)
            .collect();

        match search.run(pending)? {
            Outcome::Solved => {
                tracing::info!(
                    packages = search.pins.len(),
                    decisions = search.decisions,
                    "resolution complete"
                );
                Ok(ResolutionState {
                    platform: Some(spec.platform),
                    pins: search.pins,
                    unsatisfied: Vec::new(),
                })
            }
            Outcome::Failed(dead) => {
                tracing::debug!(
                    decisions = search.decisions,
                    learned = search.memo.failures.len(),
                    "resolution failed"
                );
                Err(dead.failure.into())
            }
        }
    }
}

struct Search<'a, I> {
    index: &'a I,
    options: &'a ResolverOptions,
    spec: &'a EnvironmentSpec,
    preferred: Option<&'a HashMap<String, (String, String, String)>>,
    /// Candidate lists, fetched once per package.
    candidates: HashMap<String, Arc<Vec<PackageCandidate>>>,
    memo: Memo,
    decisions: u64,
    pins: BTreeMap<String, Pin>,
}

impl<I: CandidateIndex> Search<'_, I> {
    fn run(&mut self, mut pending: VecDeque<Requirement>) -> Result<Outcome> {
        loop {
            self.checkpoint()?;
            let Some(requirement) = pending.pop_front() else {
                return Ok(Outcome::Solved);
            };

            if !self.pins.contains_key(&requirement.spec.name) {
                return self.decide(requirement, pending);
            }
            let pin = &self.pins[&requirement.spec.name];
            if requirement.spec.matches(&pin.candidate) {
                continue;
            }
            tracing::debug!(
                pinned = %pin.candidate,
                rejected = %requirement.spec,
                "conflict with existing pin"
            );
            let mut culprits = requirement.culprits();
            culprits.insert(requirement.spec.name.clone());
            return Ok(Outcome::Failed(Dead {
                failure: Failure::Conflict {
                    pinned: pin.requested_by.clone(),
                    pinned_version: pin.candidate.version.to_string(),
                    rejected: requirement,
                },
                culprits,
            }));
        }
    }

    /// Try each candidate matching `requirement`, newest first.
    fn decide(
        &mut self,
        requirement: Requirement,
        pending: VecDeque<Requirement>,
    ) -> Result<Outcome> {
        let name = requirement.spec.name.clone();
        let candidates = self.candidates(&name)?;
        let matching: Vec<&PackageCandidate> = candidates
            .iter()
            .filter(|c| requirement.spec.matches(c))
            .collect();

        if matching.is_empty() {
            let mut available: Vec<String> =
                candidates.iter().map(|c| c.version.to_string()).collect();
            available.dedup();
            return Ok(Outcome::Failed(Dead {
                culprits: requirement.culprits(),
                failure: Failure::Missing {
                    requirement,
                    available,
                },
            }));
        }

        let mut culprits = requirement.culprits();
        let mut newest_failure = None;
        for candidate in matching {
            self.decisions += 1;
            if self.decisions > self.options.max_decisions {
                return Err(Error::SearchBudgetExceeded(self.options.max_decisions));
            }
            tracing::debug!(
                decision = self.decisions,
                depth = self.pins.len(),
                candidate = %candidate,
                "trying"
            );

            self.pins.insert(
                name.clone(),
                Pin {
                    candidate: candidate.clone(),
                    requested_by: requirement.clone(),
                },
            );
            let outcome = match self.memo.recall(&self.pins, &name, &candidate.url) {
                Some(dead) => {
                    tracing::trace!(candidate = %candidate, "skipping known dead state");
                    Outcome::Failed(dead)
                }
                None => {
                    let mut next = pending.clone();
                    next.extend(
                        candidate
                            .depends
                            .iter()
                            .map(|dep| requirement.child(dep.clone(), candidate)),
                    );
                    self.run(next)?
                }
            };

            let dead = match outcome {
                Outcome::Solved => return Ok(Outcome::Solved),
                Outcome::Failed(dead) => dead,
            };
            self.pins.remove(&name);
            if !dead.culprits.contains(&name) {
                tracing::trace!(
                    package = %name,
                    "failure does not depend on this choice, backing up"
                );
                return Ok(Outcome::Failed(dead));
            }
            culprits.extend(dead.culprits.into_iter().filter(|c| *c != name));
            newest_failure.get_or_insert(dead.failure);
        }

        let Some(failure) = newest_failure else {
            return Err(Error::IncompleteResolution(format!(
                "no candidate of {name} was tried"
            )));
        };
        let nogood: Option<Nogood> = culprits
            .iter()
            .map(|c| self.pins.get(c).map(|pin| (c.clone(), pin.candidate.url.clone())))
            .collect();
        if let Some(nogood) = nogood {
            self.memo.learn(nogood, &failure);
        }
        Ok(Outcome::Failed(Dead { failure, culprits }))
    }

    /// Candidates for `name` on the target platform in preference order,
    /// with a previously locked build moved to the front.
    fn candidates(&mut self, name: &str) -> Result<Arc<Vec<PackageCandidate>>> {
        if let Some(found) = self.candidates.get(name) {
            return Ok(Arc::clone(found));
        }
        let platform = self.spec.platform;
        let mut found: Vec<PackageCandidate> = self
            .index
            .query(name, platform)?
            .into_iter()
            .filter(|c| c.subdir.is_compatible_with(&platform))
            .map(|mut c| {
                if let Some(priority) = self.spec.channel_priority(&c.channel) {
                    c.channel_priority = priority;
                }
                c
            })
            .collect();
        sort_candidates(&mut found, platform);

        if let Some((version, build, channel)) = self.preferred.and_then(|p| p.get(name)) {
            let locked = found.iter().position(|c| {
                c.version.as_str() == version.as_str() && c.build == *build && c.channel == *channel
            });
            if let Some(position) = locked {
                tracing::debug!(package = name, %version, %build, "preferring locked build");
                found[..=position].rotate_right(1);
            }
        }
        tracing::debug!(package = name, candidates = found.len(), "queried index");

        let found = Arc::new(found);
        self.candidates.insert(name.to_string(), Arc::clone(&found));
        Ok(found)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.options.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled("interrupted".to_string()));
        }
        if let Some(deadline) = self.options.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Cancelled(format!(
                    "deadline reached after {} decisions",
                    self.decisions
                )));
            }
        }
        Ok(())
    }
}
