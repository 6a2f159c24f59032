use std::process::Command;

use crate::common::{TestEnv, assert_contains, assert_exit_code, init_test_logging};

#[test]
fn test_help_lists_subcommands() {
    init_test_logging();
    crate::test_log!("TEST START: test_help_lists_subcommands");

    let output = Command::new(env!("CARGO_BIN_EXE_pushcid"))
        .arg("--help")
        .output()
        .expect("Failed to run pushcid --help");

    assert!(output.status.success(), "pushcid --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "run");
    assert_contains(&stdout, "tree");
    assert_contains(&stdout, "check-config");

    crate::test_log!("TEST PASS: test_help_lists_subcommands");
}

#[test]
fn test_version_matches_package() {
    init_test_logging();

    let output = Command::new(env!("CARGO_BIN_EXE_pushcid"))
        .arg("--version")
        .output()
        .expect("Failed to run pushcid --version");

    assert!(output.status.success());
    assert_contains(
        &String::from_utf8_lossy(&output.stdout),
        env!("CARGO_PKG_VERSION"),
    );
}

#[test]
fn test_check_config_prints_effective_settings() {
    init_test_logging();
    crate::test_log!("TEST START: test_check_config_prints_effective_settings");

    let env = TestEnv::new();
    let config = env.write_config("script = \"make test\"\nscript_timeout_secs = 120");

    let output = env.pushcid(&config, &["check-config"]);
    assert_exit_code(&output, 0);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: toml::Value = toml::from_str(&stdout).expect("check-config prints TOML");
    assert_eq!(parsed["job"]["script"].as_str(), Some("make test"));
    assert_eq!(parsed["job"]["script_timeout_secs"].as_integer(), Some(120));
    assert_eq!(parsed["job"]["after_script_timeout_secs"].as_integer(), Some(1));

    crate::test_log!("TEST PASS: test_check_config_prints_effective_settings");
}

#[test]
fn test_check_config_redacts_token() {
    init_test_logging();

    let env = TestEnv::new();
    let config = env.write_config("");
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pushcid"));
    let output = cmd
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .env("PUSHCI_GITHUB_TOKEN", "ghp_secret")
        .output()
        .expect("Failed to run pushcid check-config");

    assert_exit_code(&output, 0);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("ghp_secret"), "token leaked: {stdout}");
    assert_contains(&stdout, "<redacted>");
}

#[test]
fn test_check_config_rejects_out_of_range_timeout() {
    init_test_logging();

    let env = TestEnv::new();
    let config = env.write_config("script_timeout_secs = 301");

    let output = env.pushcid(&config, &["check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "PCI-E004");
    assert_contains(&stderr, "script_timeout_secs");
}

#[test]
fn test_missing_config_file_is_reported() {
    init_test_logging();

    let env = TestEnv::new();
    let missing = env.path().join("nope.toml");

    let output = env.pushcid(&missing, &["check-config"]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "PCI-E001");
}
