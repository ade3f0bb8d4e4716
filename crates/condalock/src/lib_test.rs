// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

const LINUX_REPODATA: &str = r#"{
  "info": {"subdir": "linux-64"},
  "packages.conda": {
    "pkg-a-1.0-h1_0.conda": {"name": "pkg-a", "version": "1.0", "build": "h1_0", "build_number": 0, "depends": [], "sha256": "a10"},
    "pkg-a-2.0-h1_0.conda": {"name": "pkg-a", "version": "2.0", "build": "h1_0", "build_number": 0, "depends": [], "sha256": "a20"},
    "pkg-a-2.1-h1_0.conda": {"name": "pkg-a", "version": "2.1", "build": "h1_0", "build_number": 0, "depends": [], "sha256": "a21"},
    "pkg-b-1.0-h1_0.conda": {"name": "pkg-b", "version": "1.0", "build": "h1_0", "build_number": 0, "depends": ["pkg-a ==1.0"], "sha256": "b10"},
    "pkg-c-1.0-h1_0.conda": {"name": "pkg-c", "version": "1.0", "build": "h1_0", "build_number": 0, "depends": ["__glibc >=2.17", "pkg-a"], "sha256": "c10"}
  }
}"#;

/// A workspace with a local channel and room for spec and lock files.
#[fixture]
fn workspace() -> TempDir {
    let tmp = TempDir::new().unwrap();
    for (subdir, repodata) in [
        ("linux-64", LINUX_REPODATA),
        ("noarch", r#"{"packages": {}}"#),
    ] {
        let dir = tmp.path().join("channel").join(subdir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(index::REPODATA_FILENAME), repodata).unwrap();
    }
    tmp
}

fn write_spec(workspace: &TempDir, dependencies: &str) -> PathBuf {
    let path = workspace.path().join("environment.yml");
    std::fs::write(
        &path,
        format!("channels: [./channel]\nplatform: linux-64\ndependencies: {dependencies}\n"),
    )
    .unwrap();
    path
}

fn run(workspace: &TempDir, dependencies: &str, options: ResolverOptions) -> Result<LockFile> {
    let spec = EnvironmentSpec::load(write_spec(workspace, dependencies))?;
    let index = CachedIndex::new(RepodataIndex::new(
        spec.channels.clone(),
        workspace.path().join("cache"),
    ));
    let target = workspace.path().join(LOCK_FILENAME);
    let previous = LockFile::load_previous(&target);
    create_lock(&spec, index, options, previous.as_ref(), &target)
}

#[rstest]
fn test_newest_matching_version_is_locked(workspace: TempDir) {
    let lock = run(&workspace, "['pkg-a>=2.0']", ResolverOptions::default()).unwrap();
    let entry = lock.get("pkg-a").unwrap();
    assert_eq!(entry.version, "2.1");
    assert_eq!(entry.sha256.as_deref(), Some("a21"));
    assert!(entry.url.ends_with("/linux-64/pkg-a-2.1-h1_0.conda"));

    let on_disk = LockFile::load(workspace.path().join(LOCK_FILENAME)).unwrap();
    assert_eq!(on_disk, lock);
}

#[rstest]
fn test_transitive_pin_is_locked(workspace: TempDir) {
    let lock = run(&workspace, "[pkg-a, pkg-b]", ResolverOptions::default()).unwrap();
    let pins: Vec<_> = lock
        .packages
        .iter()
        .map(|e| format!("{}@{}", e.name, e.version))
        .collect();
    assert_eq!(pins, vec!["pkg-a@1.0", "pkg-b@1.0"]);
}

#[rstest]
fn test_failed_run_leaves_existing_lock(workspace: TempDir) {
    let target = workspace.path().join(LOCK_FILENAME);
    run(&workspace, "[pkg-a]", ResolverOptions::default()).unwrap();
    let before = std::fs::read(&target).unwrap();

    let err = run(&workspace, "['pkg-a >=3']", ResolverOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Unsatisfiable { .. }), "{err:?}");
    assert_eq!(std::fs::read(&target).unwrap(), before);
}

#[rstest]
fn test_cancelled_run_writes_nothing(workspace: TempDir) {
    let options = ResolverOptions::default().with_cancel_flag(Arc::new(AtomicBool::new(true)));
    let err = run(&workspace, "[pkg-a]", options).unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{err:?}");
    assert!(!workspace.path().join(LOCK_FILENAME).exists());
}

#[rstest]
fn test_lock_tracks_spec_changes(workspace: TempDir) {
    let lock = run(&workspace, "[pkg-a]", ResolverOptions::default()).unwrap();
    let unchanged = EnvironmentSpec::load(write_spec(&workspace, "[pkg-a]")).unwrap();
    assert!(lock.is_current(&unchanged));
    let edited = EnvironmentSpec::load(write_spec(&workspace, "[pkg-a, pkg-b]")).unwrap();
    assert!(!lock.is_current(&edited));
}

#[rstest]
fn test_relock_keeps_existing_pins(workspace: TempDir) {
    let first = run(&workspace, "[pkg-a]", ResolverOptions::default()).unwrap();
    assert_eq!(first.get("pkg-a").unwrap().version, "2.1");

    let newer = LINUX_REPODATA.replace(
        r#""packages.conda": {"#,
        r#""packages.conda": {
    "pkg-a-2.2-h1_0.conda": {"name": "pkg-a", "version": "2.2", "build": "h1_0", "build_number": 0, "depends": [], "sha256": "a22"},"#,
    );
    let repodata = workspace
        .path()
        .join("channel")
        .join("linux-64")
        .join(index::REPODATA_FILENAME);
    std::fs::write(&repodata, newer).unwrap();

    let relocked = run(&workspace, "[pkg-a]", ResolverOptions::default()).unwrap();
    assert_eq!(relocked.get("pkg-a").unwrap().version, "2.1");
    assert!(relocked.diff(&first).is_empty());

    let widened = run(&workspace, "[pkg-a, pkg-b]", ResolverOptions::default()).unwrap();
    assert_eq!(widened.get("pkg-a").unwrap().version, "1.0");
    let changed: Vec<_> = widened.diff(&relocked).iter().map(|c| c.name().to_string()).collect();
    assert_eq!(changed, vec!["pkg-a", "pkg-b"]);
}

#[rstest]
fn test_virtual_dependencies_are_not_locked(workspace: TempDir) {
    let lock = run(&workspace, "[pkg-c]", ResolverOptions::default()).unwrap();
    let names: Vec<_> = lock.packages.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["pkg-a", "pkg-c"]);
    assert_eq!(lock.get("pkg-c").unwrap().depends[0], "__glibc >=2.17");
    lock.verify().unwrap();
}
