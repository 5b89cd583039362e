use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("kiln")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bake"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("delete"));
}

#[test]
fn test_bake_missing_spec_exits_2() {
    Command::cargo_bin("kiln")
        .unwrap()
        .args(["bake", "/nonexistent/image.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid spec"));
}

#[test]
fn test_bake_malformed_spec_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let spec = dir.path().join("broken.json");
    std::fs::write(&spec, r#"{ "name": "x" }"#).unwrap();

    Command::cargo_bin("kiln")
        .unwrap()
        .arg("bake")
        .arg(&spec)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid spec"));
}

#[test]
fn test_list_needs_a_provider() {
    Command::cargo_bin("kiln")
        .unwrap()
        .env_remove("KILN_PROVIDER")
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--provider"));
}

#[test]
fn test_unknown_provider_is_rejected() {
    Command::cargo_bin("kiln")
        .unwrap()
        .args(["--provider", "vsphere", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider"));
}
