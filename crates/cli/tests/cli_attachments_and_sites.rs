use assert_cmd::prelude::*;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use std::process::Command;
use tempfile::tempdir;

// base64url of "Anbei die Rechnung" and "See you soon"
const RECHNUNG_BODY: &str = "QW5iZWkgZGllIFJlY2hudW5n";
const LUNCH_BODY: &str = "U2VlIHlvdSBzb29u";

#[test]
fn cli_attachments_selects_invoices() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("messages.json");
    let messages = serde_json::json!([
        {
            "id": "m1",
            "payload": {
                "headers": [{"name": "Subject", "value": "Your order"}],
                "body": {"data": RECHNUNG_BODY},
                "parts": [
                    {"filename": "scan.pdf", "body": {"attachmentId": "ATT1"}},
                    {"filename": "logo.png", "body": {"attachmentId": "IMG"}}
                ]
            }
        },
        {
            "id": "m2",
            "payload": {
                "headers": [{"name": "Subject", "value": "Lunch"}],
                "body": {"data": LUNCH_BODY},
                "parts": [{"filename": "photo.pdf", "body": {"attachmentId": "ATT2"}}]
            }
        }
    ]);
    std::fs::write(&input, messages.to_string()).unwrap();

    let mut cmd = Command::cargo_bin("portal-scout").expect("binary built");
    cmd.args(["attachments", "--input", input.to_str().unwrap()]);
    cmd.env("NO_COLOR", "1");
    let assert = cmd.assert().success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    let v: serde_json::Value = serde_json::from_str(&out).expect("valid json");
    assert_eq!(
        v,
        serde_json::json!({
            "filtered_attachments": [{"message_id": "m1", "attachment_id": "ATT1"}]
        })
    );
}

#[test]
fn cli_attachments_extra_keywords_open_the_gate() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("message.json");
    let message = serde_json::json!({
        "id": "m2",
        "payload": {
            "headers": [{"name": "Subject", "value": "Lunch"}],
            "body": {"data": LUNCH_BODY},
            "parts": [{"filename": "photo.pdf", "body": {"attachmentId": "ATT2"}}]
        }
    });
    std::fs::write(&input, message.to_string()).unwrap();

    let mut cmd = Command::cargo_bin("portal-scout").expect("binary built");
    cmd.args([
        "attachments",
        "--input",
        input.to_str().unwrap(),
        "--keyword",
        "Lunch, dinner",
    ]);
    cmd.env("NO_COLOR", "1");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("ATT2"));
}

#[test]
fn cli_attachments_rejects_bad_json() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("broken.json");
    std::fs::write(&input, "{not json").unwrap();

    let mut cmd = Command::cargo_bin("portal-scout").expect("binary built");
    cmd.args(["attachments", "--input", input.to_str().unwrap()]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn cli_sites_lists_builtin_presets() {
    let dir = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("portal-scout").expect("binary built");
    cmd.current_dir(dir.path())
        .env("PORTAL_SCOUT_CONFIG_DIR", dir.path())
        .env("NO_COLOR", "1")
        .args(["sites", "--format", "json"]);
    let assert = cmd.assert().success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    let v: serde_json::Value = serde_json::from_str(&out).expect("valid json");
    let names: Vec<&str> = v
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "freelancermap",
            "freelance-de",
            "wg-gesucht-offers",
            "wg-gesucht-requests"
        ]
    );
    assert_eq!(v[2]["outbound"], true);
}

#[test]
fn cli_sites_rejects_invalid_config() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("sites.toml");
    std::fs::write(
        &config,
        r#"
[sites.bad]
base_url = "https://example.com/"
[sites.bad.login]
url = "/login"
identifier_field = "u"
secret_field = "p"
[sites.bad.search]
url = "/s"
[sites.bad.listing]
container = "div["

[[sites.bad.listing.fields]]
name = "title"
kind = "text"
selector = "h3"
"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("portal-scout").expect("binary built");
    cmd.args(["sites", "--config", config.to_str().unwrap()]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to load site configuration"))
        .stderr(predicate::str::contains("invalid selector 'div['"));
}
