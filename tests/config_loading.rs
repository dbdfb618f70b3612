use std::collections::BTreeMap;
use std::error::Error;
use std::io::Write;
use std::time::Duration;

use cmddispatch::config::{load_and_validate, load_from_path, PolicyOverride};
use cmddispatch::dispatch::{ConfigPolicyResolver, DispatcherOptions, PolicyResolver};
use cmddispatch::DispatchError;
use cmddispatch_test_utils::builders::{CommandConfigBuilder, ConfigFileBuilder};
use tempfile::NamedTempFile;

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> Result<NamedTempFile, Box<dyn Error>> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

const FULL: &str = r#"
[dispatcher]
parallelism = 4
completed_retention_secs = 60

[policy.default]
timeout_secs = 30
max_attempts = 2
retry_on_failure_result = true
backoff_base_secs = 0.5
backoff_max_secs = 8.0

[policy.operation.build]
max_attempts = 5
exponential = false

[command.build]
cmd = "cargo build"
priority = 1
scope = "ci"
progress_on_stdout = '^PROGRESS (?P<step>\d+)/(?P<max>\d+)\s*(?P<desc>.*)$'
metadata = { ticket = "42" }

[command.lint]
cmd = "cargo clippy"
operation = "check"
"#;

#[test]
fn full_config_round_trips_through_validation() -> TestResult {
    let file = write_config(FULL)?;
    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.dispatcher.parallelism, 4);
    let options = DispatcherOptions::from_config(&cfg);
    assert_eq!(options.parallelism, 4);
    assert_eq!(options.completed_retention, Duration::from_secs(60));

    let build = &cfg.command["build"];
    assert_eq!(build.priority, 1);
    assert_eq!(build.effective_operation("build"), "build");
    assert_eq!(build.metadata.get("ticket").map(String::as_str), Some("42"));

    let lint = &cfg.command["lint"];
    assert_eq!(lint.priority, 2);
    assert_eq!(lint.effective_operation("lint"), "check");
    Ok(())
}

#[test]
fn resolver_merges_operation_overrides() -> TestResult {
    let file = write_config(FULL)?;
    let cfg = load_and_validate(file.path())?;
    let resolver = ConfigPolicyResolver::from_config(&cfg);
    let no_meta = BTreeMap::new();

    let build = resolver.resolve("build", &no_meta);
    assert_eq!(build.max_attempts, 5);
    assert!(!build.exponential);
    assert!(build.retry_on_failure_result);
    assert_eq!(build.timeout, Some(Duration::from_secs(30)));
    assert_eq!(build.backoff_delay(3), Duration::from_millis(500));

    let other = resolver.resolve("check", &no_meta);
    assert_eq!(other.max_attempts, 2);
    assert!(other.exponential);
    assert_eq!(other.backoff_delay(1), Duration::from_millis(500));
    assert_eq!(other.backoff_delay(10), Duration::from_secs(8));
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_from_path("/definitely/not/here/Cmddispatch.toml").unwrap_err();
    assert!(matches!(err, DispatchError::IoError(_)));
}

#[test]
fn malformed_toml_is_a_parse_error() -> TestResult {
    let file = write_config("[dispatcher\nparallelism = 1")?;
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, DispatchError::TomlError(_)));
    Ok(())
}

#[test]
fn semantic_errors_are_config_errors() -> TestResult {
    for bad in [
        "[dispatcher]\nparallelism = 0\n",
        "[policy.default]\nmax_attempts = 0\n",
        "[policy.default]\nbackoff_base_secs = 5.0\nbackoff_max_secs = 1.0\n",
        "[policy.operation.x]\nbackoff_base_secs = -1.0\n",
        "[command.a]\ncmd = \"   \"\n",
        "[command.a]\ncmd = \"true\"\npriority = 0\n",
        "[command.a]\ncmd = \"true\"\nprogress_on_stdout = '(unclosed'\n",
        "[command.a]\ncmd = \"true\"\nprogress_on_stdout = '(?P<max>\\d+)'\n",
    ] {
        let file = write_config(bad)?;
        let err = load_and_validate(file.path()).unwrap_err();
        assert!(matches!(err, DispatchError::ConfigError(_)), "{bad:?} gave {err}");
    }
    Ok(())
}

#[test]
fn builders_produce_valid_configs() {
    let cfg = ConfigFileBuilder::new()
        .parallelism(3)
        .operation_policy(
            "deploy",
            PolicyOverride {
                max_attempts: Some(4),
                ..PolicyOverride::default()
            },
        )
        .with_command("deploy", CommandConfigBuilder::new("true").operation("deploy").build())
        .build();

    let resolver = ConfigPolicyResolver::from_config(&cfg);
    assert_eq!(resolver.resolve("deploy", &BTreeMap::new()).max_attempts, 4);
    assert_eq!(cfg.dispatcher.parallelism, 3);
}
