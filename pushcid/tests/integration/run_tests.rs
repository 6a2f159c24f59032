use crate::common::{TestEnv, assert_contains, assert_exit_code, init_test_logging};

const PUSH_WITHOUT_HEAD: &str = r#"{
  "ref": "refs/heads/main",
  "head_commit": null,
  "repository": {
    "name": "Hello-World",
    "fork": false,
    "owner": { "login": "Codertocat" }
  }
}"#;

const PUSH_WITH_HEAD: &str = r#"{
  "ref": "refs/heads/main",
  "head_commit": { "id": "c0ffee", "tree_id": "deadbeef", "message": "Update README" },
  "repository": {
    "name": "Hello-World",
    "fork": false,
    "owner": { "login": "Codertocat" }
  }
}"#;

#[test]
fn test_malformed_payload_fails_before_any_job() {
    init_test_logging();
    crate::test_log!("TEST START: test_malformed_payload_fails_before_any_job");

    let env = TestEnv::new();
    let config = env.write_config("");
    let payload = env.write_file("push.json", "{ not json");

    let output = env.pushcid(&config, &["run", "--payload", payload.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "PCI-E100");
    assert!(output.stdout.is_empty(), "no report expected");
    assert!(!env.workspaces().exists());

    crate::test_log!("TEST PASS: test_malformed_payload_fails_before_any_job");
}

#[test]
fn test_push_without_head_reports_resource_failure() {
    init_test_logging();

    let env = TestEnv::new();
    let config = env.write_config("script = \"true\"\nafter_script = \"true\"");
    let payload = env.write_file("push.json", PUSH_WITHOUT_HEAD);

    let output = env.pushcid(&config, &["run", "--payload", payload.to_str().unwrap()]);
    assert_exit_code(&output, 1);

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report is JSON");
    assert_eq!(report["success"], false);
    assert_eq!(report["resource_error"]["code"], "PCI-E102");
    assert_eq!(report["script"]["outcome"]["status"], "skipped");
    assert_eq!(report["after_script"]["outcome"]["status"], "skipped");
}

#[test]
fn test_unreachable_remote_still_runs_cleanup() {
    init_test_logging();
    crate::test_log!("TEST START: test_unreachable_remote_still_runs_cleanup");

    let env = TestEnv::new();
    let config = env.write_config("script = \"true\"\nafter_script = \"touch cleaned\"");
    let payload = env.write_file("push.json", PUSH_WITH_HEAD);

    let output = env.pushcid(&config, &["run", "--payload", payload.to_str().unwrap()]);
    assert_exit_code(&output, 1);

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report is JSON");
    assert_eq!(report["resource_error"]["code"], "PCI-E201");
    assert_eq!(report["script"]["outcome"]["status"], "skipped");
    assert_eq!(report["after_script"]["outcome"]["status"], "succeeded");

    let workspace = std::path::PathBuf::from(report["workspace"].as_str().expect("workspace"));
    assert_eq!(
        workspace.parent(),
        Some(
            env.workspaces()
                .join("Codertocat")
                .join("Hello-World")
                .join("c0ffee")
                .as_path()
        )
    );
    assert!(workspace.join("cleaned").exists());

    crate::test_log!("TEST PASS: test_unreachable_remote_still_runs_cleanup");
}

#[test]
fn test_path_like_names_in_payload_are_rejected() {
    init_test_logging();

    let env = TestEnv::new();
    let config = env.write_config("script = \"true\"\nafter_script = \"true\"");
    let payload = env.write_file(
        "push.json",
        &PUSH_WITH_HEAD.replace("\"c0ffee\"", "\"../../escaped\""),
    );

    let output = env.pushcid(&config, &["run", "--payload", payload.to_str().unwrap()]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "PCI-E103");
    assert!(output.stdout.is_empty(), "no report expected");
    assert!(!env.workspaces().exists());
    assert!(!env.path().join("escaped").exists());
}

#[test]
fn test_tree_command_reports_transport_errors() {
    init_test_logging();

    let env = TestEnv::new();
    let config = env.write_config("");
    let dest = env.path().join("out");

    let output = env.pushcid(
        &config,
        &[
            "tree",
            "--owner",
            "Codertocat",
            "--repo",
            "Hello-World",
            "--sha",
            "deadbeef",
            "--dest",
            dest.to_str().unwrap(),
        ],
    );
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "PCI-E201");
}
