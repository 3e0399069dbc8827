use std::sync::Arc;
use std::time::Duration;
use wasession::binary::builder::NodeBuilder;
use wasession::binary::jid::Jid;
use wasession::client::{ClientError, ConnectionState};
use wasession::config::ClientConfig;
use wasession::request::{InfoQuery, IqError};
use wasession::store::{DeviceStore, LidPnMappingStore, MemoryDeviceStore};
use wasession::test_utils::{LoopbackChannelFactory, TestClient, is_passive_iq};
use wasession::transport::{ChannelError, SecureChannelFactory};
use wasession::types::events::Event;

fn config(step: Duration) -> ClientConfig {
    ClientConfig {
        reconnect_backoff_step: step,
        default_request_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn wait_for_connections(harness: &TestClient, n: usize) {
    while harness.factory.connection_count() < n {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_login_reaches_logged_in_state() {
    let harness = TestClient::paired().await;
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    let server = harness.connect().await;
    assert_eq!(harness.client.state(), ConnectionState::AwaitingAuth);
    assert!(harness.client.is_connected());
    assert!(!harness.client.is_logged_in());

    let waiter = {
        let client = harness.client.clone();
        tokio::spawn(async move { client.wait_for_connection(Duration::from_secs(5)).await })
    };
    server.inject(&NodeBuilder::new("success").build()).await;

    assert!(waiter.await.unwrap(), "wait_for_connection should see the login");
    assert_eq!(harness.client.state(), ConnectionState::LoggedIn);
    assert!(harness.client.is_logged_in());
    assert!(harness.client.last_successful_connect.lock().await.is_some());
    assert_eq!(harness.events.count("Connected"), 1);
}

#[tokio::test]
async fn test_login_switches_to_active_mode() {
    let harness = TestClient::paired().await;
    let server = harness.connect().await;
    server.inject(&NodeBuilder::new("success").build()).await;

    let active = server
        .next_node_matching(is_passive_iq)
        .await
        .expect("client should leave passive mode after login");
    assert_eq!(active.attrs.get("type").map(String::as_str), Some("set"));
    assert_eq!(active.attrs.get("to").map(String::as_str), Some("s.whatsapp.net"));
    let children: Vec<&str> = active
        .children()
        .unwrap_or_default()
        .iter()
        .map(|c| c.tag.as_str())
        .collect();
    assert_eq!(children, vec!["active"]);
    harness.events.wait_for("Connected").await.unwrap();
}

#[tokio::test]
async fn test_rejected_active_iq_keeps_session() {
    let harness = TestClient::paired().await;
    let server = harness.connect().await;
    server.inject(&NodeBuilder::new("success").build()).await;

    let active = server.next_node_matching(is_passive_iq).await.unwrap();
    server
        .inject(
            &NodeBuilder::new("iq")
                .attrs([("from", "s.whatsapp.net"), ("id", active.attrs["id"].as_str()), ("type", "error")])
                .children([NodeBuilder::new("error")
                    .attrs([("code", "500"), ("text", "internal-error")])
                    .build()])
                .build(),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.client.state(), ConnectionState::LoggedIn);
    assert!(server.is_connected());
    assert_eq!(harness.client.pending_request_count().await, 0);
}

#[tokio::test]
async fn test_set_passive_sends_requested_mode() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    let request = {
        let client = harness.client.clone();
        tokio::spawn(async move { client.set_passive(true).await })
    };
    let sent = server.reply_to_next_iq().await.expect("passive iq");
    assert!(is_passive_iq(&sent));
    assert!(sent.get_optional_child("passive").is_some());
    request.await.unwrap().expect("server accepted the mode switch");
}

#[tokio::test]
async fn test_wait_for_connection_times_out() {
    let harness = TestClient::paired().await;
    let _server = harness.connect().await;
    assert!(
        !harness
            .client
            .wait_for_connection(Duration::from_millis(50))
            .await
    );
}

#[tokio::test]
async fn test_login_adopts_and_replaces_lid() {
    let store = MemoryDeviceStore::paired("15550001111@s.whatsapp.net".parse().unwrap(), None);
    let harness = TestClient::build(store, |b| b);
    let server = harness.connect().await;
    server
        .inject(&NodeBuilder::new("success").attr("lid", "111@lid").build())
        .await;
    harness.events.wait_for("Connected").await.unwrap();

    let device = harness.store.load_device().await.unwrap();
    assert_eq!(device.lid.as_ref().map(|l| l.user.as_str()), Some("111"));
    assert_eq!(
        harness
            .store
            .get_pn_for_lid(&"111@lid".parse().unwrap())
            .await
            .unwrap(),
        Some("15550001111@s.whatsapp.net".parse().unwrap())
    );

    harness.client.disconnect().await;
    let server = harness.connect().await;
    server
        .inject(&NodeBuilder::new("success").attr("lid", "222@lid").build())
        .await;
    harness.events.wait_for_nth("Connected", 2).await.unwrap();
    let device = harness.store.load_device().await.unwrap();
    assert_eq!(device.lid.as_ref().map(|l| l.user.as_str()), Some("222"));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let harness = TestClient::paired().await;
    let _server = harness.connect().await;
    assert!(matches!(
        harness.client.connect().await,
        Err(ClientError::AlreadyConnected)
    ));
    assert_eq!(harness.factory.attempt_count(), 1);
}

#[tokio::test]
async fn test_initial_failure_without_auto_reconnect_is_returned() {
    let harness = TestClient::paired_with(|b| {
        b.with_config(ClientConfig {
            initial_auto_reconnect: false,
            ..ClientConfig::default()
        })
    });
    harness
        .factory
        .fail_next(1, ChannelError::Network("refused".into()));
    assert!(matches!(
        harness.client.connect().await,
        Err(ClientError::Channel(ChannelError::Network(_)))
    ));
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_initial_failure_is_returned_when_auto_reconnect_is_off() {
    let harness = TestClient::paired_with(|b| {
        b.with_config(ClientConfig {
            enable_auto_reconnect: false,
            initial_auto_reconnect: true,
            ..ClientConfig::default()
        })
    });
    harness
        .factory
        .fail_next(1, ChannelError::Network("refused".into()));

    assert!(matches!(
        harness.client.connect().await,
        Err(ClientError::Channel(ChannelError::Network(_)))
    ));
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(harness.factory.attempt_count(), 1);
    assert_eq!(harness.events.count("Disconnected"), 0);
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_non_retryable_initial_failure_is_returned() {
    let harness = TestClient::paired().await;
    harness.factory.fail_next(1, ChannelError::HttpStatus(401));
    assert!(matches!(
        harness.client.connect().await,
        Err(ClientError::Channel(ChannelError::HttpStatus(401)))
    ));
    assert_eq!(harness.events.count("Disconnected"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_grows_linearly() {
    let harness = TestClient::paired_with(|b| b.with_config(config(Duration::from_secs(2))));
    harness
        .factory
        .fail_next(4, ChannelError::Network("unreachable".into()));

    harness
        .client
        .connect()
        .await
        .expect("initial auto-reconnect reports success");
    assert_eq!(harness.events.count("Disconnected"), 1);

    tokio::time::timeout(Duration::from_secs(60), wait_for_connections(&harness, 1))
        .await
        .expect("reconnect loop should eventually connect");

    let attempts = harness.factory.attempts();
    assert_eq!(attempts.len(), 5);
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![0, 2, 4, 6]);
}

#[tokio::test(start_paused = true)]
async fn test_login_resets_backoff_counter() {
    let harness = TestClient::paired_with(|b| b.with_config(config(Duration::from_secs(2))));
    harness
        .factory
        .fail_next(2, ChannelError::Network("unreachable".into()));
    harness.client.connect().await.unwrap();
    tokio::time::timeout(Duration::from_secs(60), wait_for_connections(&harness, 1))
        .await
        .unwrap();
    assert!(harness.client.auto_reconnect_errors.load(std::sync::atomic::Ordering::SeqCst) > 0);

    let server = harness.factory.server(1).await;
    server.inject(&NodeBuilder::new("success").build()).await;
    harness.events.wait_for("Connected").await.unwrap();
    assert_eq!(
        harness
            .client
            .auto_reconnect_errors
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_hook_can_stop_the_loop() {
    let harness = TestClient::paired_with(|b| {
        b.with_config(config(Duration::from_secs(2)))
            .with_auto_reconnect_hook(Arc::new(|_: &ClientError| false))
    });
    harness
        .factory
        .fail_next(10, ChannelError::Network("unreachable".into()));
    harness.client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        harness.factory.attempt_count(),
        2,
        "one initial attempt and one declined retry"
    );
}

#[tokio::test]
async fn test_unpaired_device_does_not_auto_reconnect() {
    let harness = TestClient::new().await;
    let server = harness.connect().await;
    server.close_remote().await;

    harness.events.wait_for("Disconnected").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.factory.attempt_count(), 1);
}

#[tokio::test]
async fn test_remote_close_emits_one_disconnect_and_reconnects() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    server.close_remote().await;
    let second = harness.factory.server(2).await;
    assert!(second.is_connected());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.events.count("Disconnected"), 1);
    assert_eq!(harness.factory.connection_count(), 2);
    assert_eq!(harness.client.state(), ConnectionState::AwaitingAuth);
}

#[tokio::test]
async fn test_intentional_disconnect_is_silent() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let server = harness.login().await;

    harness.client.disconnect().await;
    assert!(!server.is_connected());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.events.count("Disconnected"), 0);
    assert_eq!(harness.factory.connection_count(), 1);
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    assert!(!harness.client.is_logged_in());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let harness = TestClient::paired().await;
    harness.client.disconnect().await;

    let _server = harness.login().await;
    harness.client.disconnect().await;
    let after_first = harness.events.names();
    harness.client.disconnect().await;
    harness.client.disconnect().await;

    assert_eq!(harness.events.names(), after_first);
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        harness.client.send_node(NodeBuilder::new("presence").build()).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_reconnect_after_disconnect_is_allowed() {
    let harness = TestClient::paired().await;
    harness.login().await;
    harness.client.disconnect().await;

    let server = harness.login().await;
    assert!(server.is_connected());
    assert_eq!(harness.client.state(), ConnectionState::LoggedIn);
}

#[tokio::test]
async fn test_reset_connection_reconnects() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
    let first = harness.login().await;

    harness.client.reset_connection().await;
    assert!(!first.is_connected());
    harness.factory.server(2).await;
    harness.events.wait_for("Disconnected").await.unwrap();
    assert_eq!(harness.events.count("Disconnected"), 1);
}

#[tokio::test]
async fn test_close_of_inactive_channel_is_ignored() {
    let harness = TestClient::paired().await;
    harness.login().await;

    let (stray, _events) = LoopbackChannelFactory::new().connect().await.unwrap();
    harness.client.on_channel_closed(&stray, true).await;

    assert_eq!(harness.client.state(), ConnectionState::LoggedIn);
    assert_eq!(harness.events.count("Disconnected"), 0);
}

#[tokio::test]
async fn test_shutdown_stops_reconnecting() {
    let harness = TestClient::paired_with(|b| b.with_config(config(Duration::from_secs(60))));
    harness
        .factory
        .fail_next(10, ChannelError::Network("unreachable".into()));
    harness.client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let attempts = harness.factory.attempt_count();

    harness.client.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.factory.attempt_count(), attempts);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    server
        .inject(
            &NodeBuilder::new("iq")
                .attrs([("from", "s.whatsapp.net"), ("id", "srv-ping"), ("type", "get"), ("xmlns", "urn:xmpp:ping")])
                .children([NodeBuilder::new("ping").build()])
                .build(),
        )
        .await;

    let pong = server
        .next_node_matching(|n| n.attrs.get("id").map(String::as_str) == Some("srv-ping"))
        .await
        .expect("pong");
    assert_eq!(pong.tag, "iq");
    assert_eq!(pong.attrs.get("type").map(String::as_str), Some("result"));
    assert_eq!(pong.attrs.get("to").map(String::as_str), Some("s.whatsapp.net"));
}

#[tokio::test]
async fn test_iq_round_trip_and_server_error() {
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
    let sent = server.reply_to_next_iq().await.expect("iq sent");
    assert_eq!(sent.attrs.get("xmlns").map(String::as_str), Some("w:test"));
    assert!(request.await.unwrap().is_ok());

    let request = {
        let client = harness.client.clone();
        tokio::spawn(async move {
            client
                .send_iq(InfoQuery::set("w:test", Jid::server_jid(), None))
                .await
        })
    };
    let sent = server.next_node_matching(|n| n.tag == "iq").await.unwrap();
    server
        .inject(
            &NodeBuilder::new("iq")
                .attrs([("from", "s.whatsapp.net"), ("id", sent.attrs["id"].as_str()), ("type", "error")])
                .children([NodeBuilder::new("error")
                    .attrs([("code", "403"), ("text", "forbidden")])
                    .build()])
                .build(),
        )
        .await;
    match request.await.unwrap() {
        Err(IqError::ServerError { code, text }) => {
            assert_eq!(code, 403);
            assert_eq!(text, "forbidden");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_pending_iq_fails_when_connection_drops() {
    let harness = TestClient::paired_with(|b| b.with_config(TestClient::fast_config()));
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
    server.close_remote().await;

    assert!(matches!(
        request.await.unwrap(),
        Err(IqError::Disconnected(node)) if node.tag == "xmlstreamend"
    ));
    assert_eq!(harness.client.pending_request_count().await, 0);
}

#[tokio::test]
async fn test_iq_times_out() {
    let harness = TestClient::paired().await;
    let _server = harness.login().await;
    let result = harness
        .client
        .send_iq(
            InfoQuery::get("w:test", Jid::server_jid(), None)
                .with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(IqError::Timeout)));
    assert_eq!(harness.client.pending_request_count().await, 0);
}

#[tokio::test]
async fn test_logout_unlinks_and_clears_store() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;

    let logout = {
        let client = harness.client.clone();
        tokio::spawn(async move { client.logout().await })
    };
    let request = server.reply_to_next_iq().await.expect("logout iq");
    assert_eq!(request.attrs.get("xmlns").map(String::as_str), Some("md"));
    let remove = request
        .get_optional_child("remove-companion-device")
        .expect("remove-companion-device child");
    assert_eq!(
        remove.attrs.get("jid").map(String::as_str),
        Some("15550001111@s.whatsapp.net")
    );
    assert_eq!(remove.attrs.get("reason").map(String::as_str), Some("user_initiated"));

    logout.await.unwrap().expect("logout should succeed");
    assert!(!harness.store.load_device().await.unwrap().is_paired());
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    assert_eq!(harness.events.count("Disconnected"), 0);
}

#[tokio::test]
async fn test_logout_requires_pairing() {
    let harness = TestClient::new().await;
    assert!(matches!(
        harness.client.logout().await,
        Err(ClientError::NotLoggedIn)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_failure_reports_and_resets() {
    let harness = TestClient::paired_with(|b| {
        b.with_config(ClientConfig {
            keepalive_max_fail_time: Duration::from_secs(60),
            reconnect_backoff_step: Duration::from_secs(1),
            ..ClientConfig::default()
        })
    });
    harness.login().await;

    let long = Duration::from_secs(600);
    let Some(Event::KeepAliveTimeout(first)) = harness
        .events
        .wait_for_nth_within("KeepAliveTimeout", 1, long)
        .await
    else {
        panic!("expected a keepalive timeout: {:?}", harness.events.names());
    };
    assert_eq!(first.error_count, 1);

    harness.factory.server_within(2, long).await;
    assert!(harness.events.count("KeepAliveTimeout") >= 2);
    assert_eq!(harness.events.count("Disconnected"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_restored_after_failure() {
    let harness = TestClient::paired().await;
    let server = harness.login().await;
    let long = Duration::from_secs(600);

    // First ping goes unanswered.
    harness
        .events
        .wait_for_nth_within("KeepAliveTimeout", 1, long)
        .await
        .expect("timeout event");
    server
        .next_node_matching(|n| n.attrs.get("xmlns").map(String::as_str) == Some("w:p"))
        .await
        .expect("first ping");

    let second = server
        .reply_to_next_iq_within(long)
        .await
        .expect("second ping");
    assert_eq!(second.attrs.get("xmlns").map(String::as_str), Some("w:p"));
    assert!(
        harness
            .events
            .wait_for_nth_within("KeepAliveRestored", 1, long)
            .await
            .is_some()
    );
}
