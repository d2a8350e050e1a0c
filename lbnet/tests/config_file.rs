//! Loading daemon configuration from disk.

use clap::Parser;
use lbnet::config::{Args, Config, XsyncTransport};
use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_file() {
    let file = write_config(
        r#"{
            "node_id": 3,
            "cluster_nodes": ["192.168.10.2", "192.168.10.3"],
            "xsync_transport": "none",
            "rule_check_secs": 30,
            "log_level": "debug"
        }"#,
    );
    let cfg = Config::load(file.path()).unwrap();
    assert_eq!(cfg.node_id, 3);
    assert_eq!(cfg.xsync_transport, XsyncTransport::None);
    assert_eq!(cfg.rule_config().check_interval, Duration::from_secs(30));
    assert_eq!(cfg.log_level, "debug");
    assert_eq!(cfg.dp_batch, 32);
    cfg.validate().unwrap();
}

#[test]
fn test_flags_override_file() {
    let file = write_config(r#"{"node_id": 3, "tick_secs": 20}"#);
    let path = file.path().to_str().unwrap();
    let args = Args::try_parse_from(["lbnet", "-c", path, "--node-id", "9"]).unwrap();
    let cfg = Config::from_args(&args).unwrap();
    assert_eq!(cfg.node_id, 9);
    assert_eq!(cfg.tick(), Duration::from_secs(20));
}

#[test]
fn test_invalid_file_is_rejected() {
    let file = write_config(r#"{"ep_checkers": 0}"#);
    let args = Args {
        config: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    assert!(Config::from_args(&args).is_err());

    let file = write_config("{ not json");
    let err = Config::load(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("parsing config"));

    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(&dir.path().join("missing.json")).unwrap_err();
    assert!(format!("{err:#}").contains("reading config"));
}

#[test]
fn test_peer_addresses_use_xsync_port() {
    let file = write_config(r#"{"cluster_nodes": ["fd00::2"], "xsync_port": 4000}"#);
    let cfg = Config::load(file.path()).unwrap();
    let peers = cfg.peer_addrs();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].ip(), "fd00::2".parse::<IpAddr>().unwrap());
    assert_eq!(peers[0].port(), 4000);
}
