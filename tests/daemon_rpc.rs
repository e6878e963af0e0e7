//! End-to-end socket scenarios against a live daemon.

use std::net::SocketAddr;
use std::time::Duration;

use epgd::config::Config;
use epgd::daemon::Daemon;
use epgd::license;
use epgd::rpc::{protocol, ClientError, RpcClient};
use epgd::PROJECT_NAME;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn valid_key() -> (String, i64) {
    let expiry = chrono::Utc::now().timestamp_millis() + 86_400_000;
    (license::encode(PROJECT_NAME, expiry), expiry)
}

async fn start_daemon() -> (SocketAddr, TempDir, JoinHandle<anyhow::Result<()>>) {
    let dir = tempfile::tempdir().unwrap();
    let (key, _) = valid_key();

    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.epg_in_directory = dir.path().join("in");
    config.epg_out_directory = dir.path().join("out");
    config.license_key = Some(key);

    let daemon = Daemon::bind(config).await.unwrap();
    let addr = daemon.local_addr().unwrap();
    let handle = tokio::spawn(daemon.run());
    (addr, dir, handle)
}

async fn connect(addr: SocketAddr) -> RpcClient {
    RpcClient::connect(&addr.to_string()).await.unwrap()
}

fn activate_params(key: &str) -> Option<String> {
    Some(format!(r#"{{"license_key":"{key}"}}"#))
}

async fn activate(client: &mut RpcClient, key: &str) -> serde_json::Value {
    let result = timeout(
        TEST_TIMEOUT,
        client.call(protocol::DAEMON_ACTIVATE, activate_params(key)),
    )
    .await
    .expect("activate timed out")
    .expect("activate failed");
    serde_json::from_str(&result).expect("activate result is not json")
}

#[tokio::test]
async fn activate_returns_full_stats_and_verifies() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, expiry) = valid_key();

    // The daemon was started with its own key; any valid key activates.
    let mut client = connect(addr).await;
    let stats = activate(&mut client, &key).await;

    assert_eq!(stats["expiration_time"], serde_json::json!(expiry));
    assert_eq!(stats["project"], serde_json::json!(PROJECT_NAME));
    assert!(stats["os"].is_object());
    assert!(stats["net_total_bytes_recv"].is_number());
    assert!(stats["online_users"]["daemon"].is_number());
}

#[tokio::test]
async fn activate_is_idempotent() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, expiry) = valid_key();

    let mut client = connect(addr).await;
    let first = activate(&mut client, &key).await;
    let second = activate(&mut client, &key).await;

    assert_eq!(first["expiration_time"], serde_json::json!(expiry));
    assert_eq!(first["expiration_time"], second["expiration_time"]);
}

#[tokio::test]
async fn activate_with_invalid_key_rejected() {
    let (addr, _dir, _daemon) = start_daemon().await;

    let mut client = connect(addr).await;
    let err = timeout(
        TEST_TIMEOUT,
        client.call(protocol::DAEMON_ACTIVATE, activate_params("deadbeef")),
    )
    .await
    .expect("call timed out")
    .expect_err("bad key must be rejected");

    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, protocol::ERR_LICENSE),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn ping_echoes_timestamp_for_verified_peer() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, _) = valid_key();

    let mut client = connect(addr).await;
    activate(&mut client, &key).await;

    let result = timeout(
        TEST_TIMEOUT,
        client.call(
            protocol::DAEMON_PING_SERVICE,
            Some(r#"{"timestamp":1700000000}"#.to_string()),
        ),
    )
    .await
    .expect("ping timed out")
    .expect("ping failed");

    assert_eq!(result, r#"{"timestamp":1700000000}"#);
}

#[tokio::test]
async fn ping_from_unverified_peer_rejected() {
    let (addr, _dir, _daemon) = start_daemon().await;

    let mut client = connect(addr).await;
    let err = timeout(
        TEST_TIMEOUT,
        client.call(
            protocol::DAEMON_PING_SERVICE,
            Some(r#"{"timestamp":1}"#.to_string()),
        ),
    )
    .await
    .expect("call timed out")
    .expect_err("unverified ping must be rejected");

    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, protocol::ERR_INVALID),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn prepare_and_sync_succeed_after_activate() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, _) = valid_key();

    let mut client = connect(addr).await;
    activate(&mut client, &key).await;

    let state = client
        .call(protocol::DAEMON_PREPARE_SERVICE, Some("{}".to_string()))
        .await
        .expect("prepare failed");
    assert_eq!(state, "{}");

    let sync = client
        .call(protocol::DAEMON_SYNC_SERVICE, Some("{}".to_string()))
        .await
        .expect("sync failed");
    assert_eq!(sync, "{}");
}

#[tokio::test]
async fn unknown_method_gets_no_reply() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, _) = valid_key();

    let mut client = connect(addr).await;
    activate(&mut client, &key).await;

    client
        .send("daemon_reboot_universe", Some("{}".to_string()))
        .await
        .unwrap();

    // The next response must be for the ping, proving the unknown
    // method was dropped without a reply.
    let result = timeout(
        TEST_TIMEOUT,
        client.call(
            protocol::DAEMON_PING_SERVICE,
            Some(r#"{"timestamp":7}"#.to_string()),
        ),
    )
    .await
    .expect("ping timed out")
    .expect("ping failed");
    assert_eq!(result, r#"{"timestamp":7}"#);
}

#[tokio::test]
async fn stop_from_loopback_unverified_peer_stops_daemon() {
    let (addr, _dir, daemon) = start_daemon().await;

    let mut client = connect(addr).await;
    client
        .send(protocol::DAEMON_STOP_SERVICE, Some("{}".to_string()))
        .await
        .unwrap();

    let run_result = timeout(TEST_TIMEOUT, daemon)
        .await
        .expect("daemon did not stop")
        .expect("daemon task panicked");
    assert!(run_result.is_ok());
}

#[tokio::test]
async fn stop_without_params_rejected() {
    let (addr, _dir, _daemon) = start_daemon().await;

    let mut client = connect(addr).await;
    let err = timeout(
        TEST_TIMEOUT,
        client.call(protocol::DAEMON_STOP_SERVICE, None),
    )
    .await
    .expect("call timed out")
    .expect_err("stop without params must be rejected");

    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, protocol::ERR_INVALID),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn get_log_with_non_http_target_fails() {
    let (addr, _dir, _daemon) = start_daemon().await;
    let (key, _) = valid_key();

    let mut client = connect(addr).await;
    activate(&mut client, &key).await;

    let err = timeout(
        TEST_TIMEOUT,
        client.call(
            protocol::DAEMON_GET_LOG_SERVICE,
            Some(r#"{"path":"ftp://example.com/logs"}"#.to_string()),
        ),
    )
    .await
    .expect("call timed out")
    .expect_err("non-http log target must fail");

    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, protocol::ERR_EXTERNAL),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn refresh_url_failure_reported_asynchronously() {
    let (addr, _dir, _daemon) = start_daemon().await;

    // Unreachable port: the worker fails and the reply arrives through
    // the loop hand-off.
    let mut client = connect(addr).await;
    let err = timeout(
        TEST_TIMEOUT,
        client.call(
            protocol::DAEMON_REFRESH_URL,
            Some(r#"{"url":"http://127.0.0.1:9/guide.xml"}"#.to_string()),
        ),
    )
    .await
    .expect("call timed out")
    .expect_err("unreachable refresh url must fail");

    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, protocol::ERR_EXTERNAL),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn deposited_epg_file_is_split_per_channel() {
    let (_addr, dir, _daemon) = start_daemon().await;

    let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <programme channel="c1" start="20240101000000"><title>a</title></programme>
  <programme channel="c2" start="20240101010000"><title>b</title></programme>
  <programme channel="c1" start="20240101020000"><title>c</title></programme>
</tv>"#;
    std::fs::write(dir.path().join("in").join("a.xml"), doc).unwrap();

    let out = dir.path().join("out");
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if out.join("c1.xml").exists() && out.join("c2.xml").exists() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "split outputs did not appear"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let c1 = std::fs::read_to_string(out.join("c1.xml")).unwrap();
    let c2 = std::fs::read_to_string(out.join("c2.xml")).unwrap();
    assert_eq!(c1.matches("<programme").count(), 2);
    assert_eq!(c2.matches("<programme").count(), 1);
    for content in [&c1, &c2] {
        assert!(content.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
        assert!(content.contains("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">"));
        assert!(content.contains("<tv generator-info-name=\"dvb-epg-gen\">"));
        assert!(content.ends_with("</tv>\n"));
    }
}
