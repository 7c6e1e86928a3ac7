//! Tests for the trackersim binary's argument handling and startup checks.

use assert_cmd::Command;
use predicates::prelude::*;

fn trackersim() -> Command {
    let mut cmd = Command::cargo_bin("trackersim").unwrap();
    cmd.env_remove("TRACKERSIM_CONFIG")
        .env_remove("TRACKERSIM_API_KEY")
        .env_remove("TRACKERSIM_API_HOST")
        .env_remove("TRACKERSIM_DEVICE_ID")
        .env_remove("TRACKERSIM_CERTS_DIR")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    trackersim()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("diag"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("shadow"));
}

#[test]
fn test_cli_version() {
    trackersim()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("trackersim"));
}

#[test]
fn test_cli_shadow_help_lists_options() {
    trackersim()
        .args(["shadow", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--location-interval"))
        .stdout(predicate::str::contains("--counter-enable"));
}

#[test]
fn test_cli_unknown_subcommand() {
    trackersim().arg("fly").assert().failure();
}

#[test]
fn test_cli_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    trackersim()
        .args(["--config", path.to_str().unwrap(), "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.toml"));
}

#[test]
fn test_cli_rejects_placeholder_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[cloud]\napi_key = \"<YOUR_API_KEY>\"\n").unwrap();

    trackersim()
        .args(["-v", "--config", path.to_str().unwrap(), "provision"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_key"));
}

#[test]
fn test_cli_shadow_requires_a_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[cloud]\napi_key = \"test-key\"\napi_host = \"http://127.0.0.1:9\"\n\
             certs_dir = \"{}\"\n",
            dir.path().display()
        ),
    )
    .unwrap();

    trackersim()
        .args(["--config", path.to_str().unwrap(), "shadow"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to update"));
}

#[test]
fn test_cli_rejects_zero_interval() {
    trackersim()
        .args(["shadow", "--location-interval", "0"])
        .assert()
        .failure();
}

#[test]
fn test_cli_diag_fails_when_broker_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let certs = dir.path();
    for name in ["dev-1.key.pem", "dev-1.cert.pem", "AmazonRootCA1.pem"] {
        std::fs::write(certs.join(name), "PEM").unwrap();
    }
    std::fs::write(
        certs.join("dev-1.mqtt_info.json"),
        r#"{"mqtt_host":"127.0.0.1","topic_d2c":"p/m/d/dev-1/d2c","topic_c2d":"p/m/d/dev-1/+/r"}"#,
    )
    .unwrap();

    let path = certs.join("config.toml");
    std::fs::write(
        &path,
        format!(
            r#"[cloud]
api_key = "test-key"
api_host = "http://127.0.0.1:9"
device_id = "dev-1"
certs_dir = "{}"

[mqtt]
port = 9
connect_timeout_secs = 1
reconnect_min_delay_secs = 1
reconnect_max_delay_secs = 1
"#,
            certs.display()
        ),
    )
    .unwrap();

    trackersim()
        .args(["--config", path.to_str().unwrap(), "diag"])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .failure()
        .stdout(predicate::str::contains("Connect:"))
        .stderr(predicate::str::contains("Diagnostics for dev-1 failed"));
}
