use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wasession::binary::builder::NodeBuilder;
use wasession::binary::jid::Jid;
use wasession::binary::node::Node;
use wasession::client::ConnectionState;
use wasession::config::ClientConfig;
use wasession::hooks::CredentialRefresher;
use wasession::request::{InfoQuery, IqError};
use wasession::store::DeviceStore;
use wasession::test_utils::TestClient;
use wasession::types::events::{ConnectFailureReason, Event, TempBanReason};

fn stream_error(code: &str) -> Node {
    NodeBuilder::new("stream:error").attr("code", code).build()
}

fn conflict(code: Option<&str>, kind: &str) -> Node {
    let mut builder = NodeBuilder::new("stream:error");
    if let Some(code) = code {
        builder = builder.attr("code", code);
    }
    builder
        .children([NodeBuilder::new("conflict").attr("type", kind).build()])
        .build()
}

fn failure(reason: &str) -> NodeBuilder {
    NodeBuilder::new("failure").attr("reason", reason)
}

/// Counts refreshes and fails them on request.
#[derive(Default)]
struct ScriptedRefresher {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl CredentialRefresher for ScriptedRefresher {
    async fn refresh(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("token endpoint unreachable");
        }
        Ok(())
    }
}

/// Closes the connection from the server and checks that nothing reconnects.
async fn assert_stays_down(harness: &TestClient) {
    if let Some(server) = harness.factory.latest_server() {
        server.close_remote().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.events.count("Disconnected"), 0);
    assert_eq!(harness.factory.connection_count(), 1);
}

#[tokio::test]
async fn test_restart_required_reconnects() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    server.inject(&stream_error("515")).await;

    let second = harness.factory.server(2).await;
    assert!(!server.is_connected());
    assert!(second.is_connected());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.count("Disconnected"), 0);
    assert_eq!(harness.client.state(), ConnectionState::AwaitingAuth);
}

#[tokio::test]
async fn test_restart_required_with_manual_login() {
    let harness = TestClient::paired_with(|b| {
        b.with_config(ClientConfig {
            disable_login_auto_reconnect: true,
            ..TestClient::fast_config()
        })
    });
    let server = harness.login().await;

    server.inject(&stream_error("515")).await;
    harness
        .events
        .wait_for("ManualLoginReconnect")
        .await
        .expect("manual reconnect event");
    assert!(!harness.client.is_logged_in());
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_device_removed_logs_out() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    server.inject(&conflict(Some("401"), "device_removed")).await;
    let Some(Event::LoggedOut(logged_out)) = harness.events.wait_for("LoggedOut").await else {
        panic!("expected LoggedOut: {:?}", harness.events.names());
    };
    assert!(!logged_out.on_connect);
    assert_eq!(logged_out.reason, ConnectFailureReason::LoggedOut);
    assert!(!harness.store.load_device().await.unwrap().is_paired());
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_replaced_stream_is_terminal() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    server.inject(&conflict(None, "replaced")).await;
    harness
        .events
        .wait_for("StreamReplaced")
        .await
        .expect("replaced event");
    assert!(harness.store.load_device().await.unwrap().is_paired());
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_service_unavailable_waits_for_reconnect() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    server.inject(&stream_error("503")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.client.is_logged_in());
    assert_eq!(harness.events.count("StreamError"), 0);

    server.close_remote().await;
    harness.factory.server(2).await;
    assert_eq!(harness.events.count("Disconnected"), 1);
}

#[tokio::test]
async fn test_unknown_stream_error_is_reported() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    server.inject(&stream_error("999")).await;
    let Some(Event::StreamError(err)) = harness.events.wait_for("StreamError").await else {
        panic!("expected StreamError: {:?}", harness.events.names());
    };
    assert_eq!(err.code, "999");
    assert_eq!(err.raw.map(|n| n.tag).as_deref(), Some("stream:error"));
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let refresher = Arc::new(ScriptedRefresher::default());
    let harness = TestClient::paired_with(|b| b.with_credential_refresher(refresher.clone()));
    let server = harness.login().await;

    server.inject(&stream_error("413")).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while refresher.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refresher should run");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.count("StreamError"), 0);
    assert_eq!(harness.events.count("CatRefreshError"), 0);
}

#[tokio::test]
async fn test_failed_refresh_is_terminal() {
    let refresher = Arc::new(ScriptedRefresher {
        fail: true,
        ..Default::default()
    });
    let harness = TestClient::paired_with(|b| {
        b.with_config(TestClient::fast_config())
            .with_credential_refresher(refresher.clone())
    });
    let server = harness.login().await;

    server.inject(&stream_error("414")).await;
    let Some(Event::CatRefreshError(err)) = harness.events.wait_for("CatRefreshError").await
    else {
        panic!("expected CatRefreshError: {:?}", harness.events.names());
    };
    assert!(err.error.contains("token endpoint unreachable"));
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_expired_token_without_refresher_is_reported() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    server.inject(&stream_error("413")).await;
    let Some(Event::StreamError(err)) = harness.events.wait_for("StreamError").await else {
        panic!("expected StreamError: {:?}", harness.events.names());
    };
    assert_eq!(err.code, "413");
}

#[tokio::test]
async fn test_stream_error_fails_pending_requests() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    let request = {
        let client = harness.client.clone();
        tokio::spawn(async move {
            client
                .send_iq(InfoQuery::get("w:test", Jid::server_jid(), None))
                .await
        })
    };
    server.next_node_matching(|n| n.tag == "iq").await.unwrap();
    server.inject(&stream_error("999")).await;

    match request.await.unwrap() {
        Err(IqError::Disconnected(node)) => {
            assert_eq!(node.tag, "stream:error");
            assert_eq!(node.attrs.get("code").map(String::as_str), Some("999"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_logged_out_clears_pairing() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.connect().await;

    server.inject(&failure("401").build()).await;
    let Some(Event::LoggedOut(logged_out)) = harness.events.wait_for("LoggedOut").await else {
        panic!("expected LoggedOut: {:?}", harness.events.names());
    };
    assert!(logged_out.on_connect);
    assert_eq!(logged_out.reason, ConnectFailureReason::LoggedOut);
    assert!(!harness.store.load_device().await.unwrap().is_paired());
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_failure_temporary_ban() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.connect().await;

    server
        .inject(
            &failure("402")
                .attrs([("code", "101"), ("expire", "3600")])
                .build(),
        )
        .await;
    let Some(Event::TemporaryBan(ban)) = harness.events.wait_for("TemporaryBan").await else {
        panic!("expected TemporaryBan: {:?}", harness.events.names());
    };
    assert_eq!(ban.code, TempBanReason::SentToTooManyPeople);
    assert_eq!(ban.expire, Duration::from_secs(3600));
    assert!(harness.store.load_device().await.unwrap().is_paired());
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_failure_client_outdated() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.connect().await;

    server.inject(&failure("405").build()).await;
    harness
        .events
        .wait_for("ClientOutdated")
        .await
        .expect("outdated event");
    assert_stays_down(&harness).await;
}

#[tokio::test]
async fn test_failure_service_unavailable_reconnects() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.connect().await;

    server.inject(&failure("503").build()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.count("ConnectFailure"), 0);

    server.close_remote().await;
    harness.factory.server(2).await;
    assert_eq!(harness.events.count("Disconnected"), 1);
}

#[tokio::test]
async fn test_failure_unknown_reason_is_reported() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.connect().await;

    server
        .inject(&failure("409").attr("message", "bad user agent").build())
        .await;
    let Some(Event::ConnectFailure(failure)) = harness.events.wait_for("ConnectFailure").await
    else {
        panic!("expected ConnectFailure: {:?}", harness.events.names());
    };
    assert_eq!(failure.reason, ConnectFailureReason::BadUserAgent);
    assert_eq!(failure.message, "bad user agent");
    assert!(failure.raw.is_some());
    assert_stays_down(&harness).await;
}
