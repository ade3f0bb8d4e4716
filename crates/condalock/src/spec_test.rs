// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;
use tempfile::TempDir;

use super::*;

#[rstest]
fn test_load_environment_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("environment.yml");
    std::fs::write(
        &path,
        r#"
name: demo
channels:
  - conda-forge
platform: linux-64
dependencies:
  - python >=3.11
  - numpy=1.26
  - conda-forge::pandas
"#,
    )
    .unwrap();

    let spec = EnvironmentSpec::load(&path).unwrap();
    assert_eq!(spec.name.as_deref(), Some("demo"));
    assert_eq!(spec.platform, Platform::Linux64);
    assert_eq!(spec.channels.len(), 1);
    assert_eq!(spec.channels[0].name, "conda-forge");
    let names: Vec<_> = spec.requirements.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["python", "numpy", "pandas"]);
    assert_eq!(spec.requirements[2].channel.as_deref(), Some("conda-forge"));
    assert!(spec.source_path.is_some());
}

#[rstest]
fn test_defaults_when_fields_missing() {
    let spec = EnvironmentSpec::from_yaml("dependencies: [python]").unwrap();
    assert_eq!(spec.name, None);
    assert_eq!(spec.platform, crate::DEFAULT_PLATFORM);
    let channels: Vec<_> = spec.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(channels, vec!["emscripten-forge", "conda-forge"]);
}

#[rstest]
fn test_pip_entries_are_set_aside() {
    let spec = EnvironmentSpec::from_yaml(
        r#"
dependencies:
  - python
  - pip:
      - requests
      - rich
"#,
    )
    .unwrap();
    assert_eq!(spec.requirements.len(), 1);
    assert_eq!(spec.pip_requirements, vec!["requests", "rich"]);
}

#[rstest]
#[case::not_yaml("dependencies: [python")]
#[case::dependencies_not_a_list("dependencies: python")]
#[case::bad_requirement("dependencies: ['numpy >=']")]
#[case::unknown_platform("platform: amiga-68k\ndependencies: []")]
#[case::unknown_field("dependecies: [python]")]
fn test_malformed_specs(#[case] yaml: &str) {
    let err = EnvironmentSpec::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::MalformedSpec { .. }), "{err:?}");
}

#[rstest]
fn test_malformed_file_names_path() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("environment.yml");
    std::fs::write(&path, "dependencies: ['numpy >=']").unwrap();
    match EnvironmentSpec::load(&path).unwrap_err() {
        Error::MalformedSpec {
            path: Some(reported),
            message,
        } => {
            assert_eq!(reported, path);
            assert!(message.contains("numpy >="), "{message}");
        }
        other => panic!("expected a malformed spec, got {other:?}"),
    }
}

#[rstest]
fn test_missing_file() {
    let err = EnvironmentSpec::load("/nonexistent/environment.yml").unwrap_err();
    assert!(matches!(err, Error::ReadFailed { .. }), "{err:?}");
}

#[rstest]
fn test_unknown_channel() {
    let err = EnvironmentSpec::from_yaml("channels: [bogus]\ndependencies: [python]").unwrap_err();
    assert!(matches!(err, Error::UnknownSource { ref channel, .. } if channel == "bogus"));
}

#[rstest]
fn test_channel_prefix_must_be_enabled() {
    let err = EnvironmentSpec::from_yaml(
        "channels: [conda-forge]\ndependencies: ['emscripten-forge::numpy']",
    )
    .unwrap_err();
    match err {
        Error::UnknownSource { channel, known } => {
            assert_eq!(channel, "emscripten-forge");
            assert_eq!(known, vec!["conda-forge"]);
        }
        other => panic!("expected an unknown source, got {other:?}"),
    }
}

#[rstest]
fn test_channel_prefix_by_mirror_url() {
    let spec = EnvironmentSpec::from_yaml(
        "channels: [conda-forge]\ndependencies: ['https://prefix.dev/conda-forge::numpy']",
    )
    .unwrap();
    assert_eq!(spec.requirements[0].channel.as_deref(), Some("conda-forge"));
}

#[rstest]
fn test_relative_local_channel() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir(tmp.path().join("channel")).unwrap();
    let path = tmp.path().join("environment.yml");
    std::fs::write(&path, "channels: [./channel]\ndependencies: [a]").unwrap();

    let spec = EnvironmentSpec::load(&path).unwrap();
    assert!(spec.channels[0].url.starts_with("file://"));
}

#[rstest]
fn test_platform_override() {
    let loader = SpecLoader::default().with_platform_override(Some(Platform::OsxArm64));
    let spec = loader
        .from_yaml("platform: linux-64\ndependencies: [python]", None)
        .unwrap();
    assert_eq!(spec.platform, Platform::OsxArm64);
}

#[rstest]
fn test_configured_registry_and_platform() {
    let registry = ChannelRegistry::default()
        .with_alias("internal", "https://pkgs.example.com/internal")
        .with_default_channels(vec!["internal".to_string()]);
    let loader = SpecLoader::new(registry, Platform::Win64);
    let spec = loader.from_yaml("dependencies: [python]", None).unwrap();
    assert_eq!(spec.platform, Platform::Win64);
    assert_eq!(spec.channels[0].url, "https://pkgs.example.com/internal");
}

#[rstest]
fn test_fingerprint_tracks_inputs() {
    let base = EnvironmentSpec::from_yaml("dependencies: [python >=3.11, numpy]").unwrap();
    let same = EnvironmentSpec::from_yaml(
        "# comments and layout do not matter\ndependencies:\n  - python>=3.11\n  - numpy\n",
    )
    .unwrap();
    let changed = EnvironmentSpec::from_yaml("dependencies: [python >=3.12, numpy]").unwrap();
    let other_platform =
        EnvironmentSpec::from_yaml("platform: linux-64\ndependencies: [python >=3.11, numpy]")
            .unwrap();

    assert!(base.fingerprint().starts_with("sha256:"));
    assert_eq!(base.fingerprint(), same.fingerprint());
    assert_ne!(base.fingerprint(), changed.fingerprint());
    assert_ne!(base.fingerprint(), other_platform.fingerprint());
}
