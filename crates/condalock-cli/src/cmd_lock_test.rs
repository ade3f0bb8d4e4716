// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use clap::Parser;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

#[derive(Parser)]
struct Wrapper {
    #[clap(flatten)]
    cmd: CmdLock,
}

fn parse(args: &[&str]) -> CmdLock {
    let argv = std::iter::once("create-lock").chain(args.iter().copied());
    Wrapper::try_parse_from(argv).unwrap().cmd
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// A local channel, a config pointing the cache into the temp dir, and
/// an environment file using both.
#[fixture]
fn project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let subdir = tmp.path().join("channel").join("linux-64");
    std::fs::create_dir_all(&subdir).unwrap();
    std::fs::write(
        subdir.join("repodata.json"),
        r#"{"packages.conda": {
            "zlib-1.3-h0_0.conda": {"name": "zlib", "version": "1.3", "build": "h0_0", "depends": []},
            "zlib-1.2.13-h0_0.conda": {"name": "zlib", "version": "1.2.13", "build": "h0_0", "depends": []}
        }}"#,
    )
    .unwrap();
    std::fs::write(
        tmp.path().join("config.yaml"),
        format!("cache_dir: {}\n", tmp.path().join("cache").display()),
    )
    .unwrap();
    write_spec(&tmp, "zlib");
    tmp
}

fn write_spec(project: &TempDir, requirement: &str) {
    std::fs::write(
        project.path().join("environment.yml"),
        format!("channels: [./channel]\nplatform: linux-64\ndependencies: ['{requirement}']\n"),
    )
    .unwrap();
}

fn command(project: &TempDir, extra: &[&str]) -> CmdLock {
    let spec = path_arg(&project.path().join("environment.yml"));
    let lock = path_arg(&project.path().join("environment.lock.yaml"));
    let config = path_arg(&project.path().join("config.yaml"));
    let mut args = vec![spec.as_str(), lock.as_str(), "--config", config.as_str()];
    args.extend_from_slice(extra);
    parse(&args)
}

#[rstest]
fn test_parse_flags() {
    let cmd = parse(&[
        "env.yml",
        "env.lock.yaml",
        "--platform",
        "osx-arm64",
        "--max-decisions",
        "10",
        "--timeout",
        "5",
        "--check",
    ]);
    assert_eq!(cmd.spec, PathBuf::from("env.yml"));
    assert_eq!(cmd.lock, PathBuf::from("env.lock.yaml"));
    assert_eq!(cmd.platform, Some(Platform::OsxArm64));
    assert_eq!(cmd.max_decisions, Some(10));
    assert_eq!(cmd.timeout, Some(5));
    assert!(cmd.check);
}

#[rstest]
fn test_unknown_platform_flag_is_rejected() {
    let argv = ["create-lock", "env.yml", "env.lock.yaml", "--platform", "amiga"];
    assert!(Wrapper::try_parse_from(argv).is_err());
}

#[rstest]
fn test_both_paths_are_required() {
    assert!(Wrapper::try_parse_from(["create-lock", "env.yml"]).is_err());
}

#[rstest]
#[tokio::test]
async fn test_writes_lock(project: TempDir) {
    let code = command(&project, &[]).run(true).await.unwrap();
    assert_eq!(code, 0);

    let lock = LockFile::load(project.path().join("environment.lock.yaml")).unwrap();
    assert_eq!(lock.platform, Platform::Linux64);
    assert_eq!(lock.get("zlib").unwrap().version, "1.3");
}

#[rstest]
#[tokio::test]
async fn test_platform_flag_overrides_spec(project: TempDir) {
    // the channel publishes neither osx-64 nor noarch
    let result = command(&project, &["--platform", "osx-64"]).run(true).await;
    assert!(result.is_err());
    assert!(!project.path().join("environment.lock.yaml").exists());
}

#[rstest]
#[tokio::test]
async fn test_check_exit_codes(project: TempDir) {
    assert_eq!(command(&project, &["--check"]).run(true).await.unwrap(), 2);

    command(&project, &[]).run(true).await.unwrap();
    assert_eq!(command(&project, &["--check"]).run(true).await.unwrap(), 0);

    write_spec(&project, "zlib <1.3");
    assert_eq!(command(&project, &["--check"]).run(true).await.unwrap(), 1);
}

#[rstest]
#[tokio::test]
async fn test_failure_is_reported(project: TempDir) {
    write_spec(&project, "zlib >=2");
    let report = command(&project, &[]).run(true).await.unwrap_err();
    let err = report.downcast_ref::<Error>().unwrap();
    assert!(matches!(err, Error::Unsatisfiable { .. }), "{err:?}");
    assert!(!project.path().join("environment.lock.yaml").exists());
}

#[rstest]
#[tokio::test]
async fn test_summary_lists_packages_then_changes(project: TempDir) {
    let target = project.path().join("environment.lock.yaml");
    command(&project, &[]).run(true).await.unwrap();
    let first = LockFile::load(&target).unwrap();

    let table = summary(&first, None);
    assert_eq!(table.len(), 1);
    let columns: Vec<_> = table[0].split_whitespace().collect();
    assert_eq!(&columns[..3], &["zlib", "1.3", "h0_0"]);

    let unchanged = summary(&first, Some(&first));
    assert!(unchanged[0].contains("No package changes"));

    write_spec(&project, "zlib <1.3");
    command(&project, &[]).run(true).await.unwrap();
    let second = LockFile::load(&target).unwrap();
    let changes = summary(&second, Some(&first));
    assert_eq!(changes.len(), 1);
    assert!(changes[0].contains("zlib 1.3 h0_0 -> 1.2.13 h0_0"), "{}", changes[0]);
}

#[rstest]
#[tokio::test]
async fn test_relock_keeps_locked_version(project: TempDir) {
    let target = project.path().join("environment.lock.yaml");
    write_spec(&project, "zlib <1.3");
    command(&project, &[]).run(true).await.unwrap();

    write_spec(&project, "zlib");
    command(&project, &[]).run(true).await.unwrap();
    let lock = LockFile::load(&target).unwrap();
    assert_eq!(lock.get("zlib").unwrap().version, "1.2.13");
}
