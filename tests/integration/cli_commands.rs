#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    volume: PathBuf,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let volume = dir.path().join("cli.strata");
        let config = dir.path().join("config.toml");
        Self {
            _dir: dir,
            volume,
            config,
        }
    }

    fn strata(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("strata");
        cmd.env_remove("STRATA_VOLUME")
            .env_remove("STRATA_CONFIG")
            .arg("--volume")
            .arg(&self.volume)
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn stdout(&self, args: &[&str]) -> String {
        let output = self
            .strata()
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        String::from_utf8(output).expect("utf8 output").trim().to_string()
    }

    fn json(&self, args: &[&str]) -> Value {
        let mut full = vec!["--format", "json"];
        full.extend_from_slice(args);
        serde_json::from_str(&self.stdout(&full)).expect("valid json")
    }
}

#[test]
fn put_get_del_round_trip() {
    let ws = Workspace::new();
    ws.strata()
        .args(["init", "--page-size", "1024"])
        .assert()
        .success();
    let serial = ws.stdout(&["create-file"]);
    assert_eq!(serial, "1");

    let oid = ws.stdout(&["put", "--file", "1", "hello strata"]);
    assert_eq!(ws.stdout(&["get", &oid]), "hello strata");

    let listing = ws.json(&["ls", "--file", "1"]);
    assert_eq!(listing["objects"][0].as_str(), Some(oid.as_str()));
    assert_eq!(listing["pages"].as_array().map(Vec::len), Some(1));

    let deleted = ws.json(&["del", "--file", "1", &oid]);
    assert_eq!(deleted["released_pages"].as_u64(), Some(0));
    ws.strata().args(["get", &oid]).assert().failure();
}

#[test]
fn hex_payloads_and_page_inspection() {
    let ws = Workspace::new();
    ws.strata()
        .args(["init", "--page-size", "2048", "--volume-id", "3"])
        .assert()
        .success();
    ws.strata().arg("create-file").assert().success();

    let put = ws.json(&["put", "--file", "1", "--hex", "--tag", "9", "deadbeef"]);
    assert_eq!(put["len"].as_u64(), Some(4));
    let oid = put["oid"].as_str().expect("oid").to_string();
    assert!(oid.starts_with("3:"));

    let object = ws.json(&["get", "--hex", &oid]);
    assert_eq!(object["data"].as_str(), Some("deadbeef"));
    assert_eq!(object["tag"].as_u64(), Some(9));

    let page: u32 = oid.split(':').nth(1).and_then(|p| p.parse().ok()).expect("page");
    let summary = ws.json(&["inspect", "--page", &page.to_string()]);
    assert_eq!(summary["live_objects"].as_u64(), Some(1));
    assert_eq!(summary["file_serial"].as_u64(), Some(1));

    let volume = ws.json(&["inspect"]);
    assert_eq!(volume["volume"].as_u64(), Some(3));
    assert_eq!(volume["page_size"].as_u64(), Some(2048));
    assert_eq!(volume["files"].as_u64(), Some(1));
}

#[test]
fn config_file_supplies_store_defaults() {
    let ws = Workspace::new();
    fs::write(
        &ws.config,
        "[store]\npage_size = 512\npages_per_extent = 4\n",
    )
    .expect("write config");
    ws.strata().arg("init").assert().success();
    let volume = ws.json(&["inspect"]);
    assert_eq!(volume["page_size"].as_u64(), Some(512));
}

#[test]
fn bad_input_fails_cleanly() {
    let ws = Workspace::new();
    ws.strata().arg("init").assert().success();
    ws.strata().arg("create-file").assert().success();
    ws.strata()
        .args(["put", "--file", "1", "--hex", "not-hex"])
        .assert()
        .failure();
    ws.strata()
        .args(["get", "1:2:3"])
        .assert()
        .failure();
    ws.strata().arg("init").assert().failure();
}
