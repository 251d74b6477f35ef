use predicates::prelude::*;

mod common;

#[test]
fn test_templates_table() {
    let mut ctx = common::usm(common::BASIC_CONFIG);
    ctx.cmd
        .arg("templates")
        .assert()
        .success()
        .stdout(predicate::str::contains("ID"))
        .stdout(predicate::str::contains("CATEGORY"))
        .stdout(predicate::str::contains("Web Server"))
        .stdout(predicate::str::contains("development"))
        .stdout(predicate::str::contains("8080-8099"))
        .stdout(predicate::str::contains("MULTI"))
        .stdout(predicate::str::contains("redis-server"));
}

#[test]
fn test_templates_json() {
    let mut ctx = common::usm(common::BASIC_CONFIG);
    let output = ctx.cmd.args(["templates", "--json"]).output().unwrap();
    assert!(output.status.success());

    let templates: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let templates = templates.as_array().unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0]["id"], "web");
    assert_eq!(templates[0]["port_range"], serde_json::json!([8080, 8099]));
    assert_eq!(templates[1]["id"], "cache");
    assert_eq!(templates[1]["category"], "core");
    assert_eq!(templates[1]["supports_multiple"], true);
    assert_eq!(templates[1]["health_timeout_ms"], 5000);
}

#[test]
fn test_templates_empty_config() {
    let mut ctx = common::usm("");
    ctx.cmd
        .args(["templates", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}
