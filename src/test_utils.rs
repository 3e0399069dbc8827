//! In-process doubles for exercising a [`Client`] without a network: a
//! loopback channel whose server end is driven by the test, a JSON wire codec,
//! an event recorder and a harness tying them to a memory store.

use crate::client::{Client, ClientBuilder};
use crate::codec::{CodecError, WireCodec};
use crate::config::ClientConfig;
use crate::id::CounterIdGenerator;
use crate::store::MemoryDeviceStore;
use crate::transport::{ChannelError, ChannelEvent, SecureChannel, SecureChannelFactory};
use crate::types::events::{Event, EventHandler};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Instant, timeout};
use wasession_core::binary::builder::NodeBuilder;
use wasession_core::binary::jid::SERVER_JID;
use wasession_core::binary::node::Node;

const WAIT: Duration = Duration::from_secs(5);

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frames are the JSON form of [`Node`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn decode(&self, frame: &[u8]) -> Result<Node, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(&self, node: &Node) -> Result<Bytes, CodecError> {
        serde_json::to_vec(node)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

struct LoopbackChannel {
    connected: AtomicBool,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedSender<Bytes>,
    failing_frames: StdMutex<Vec<String>>,
}

#[async_trait]
impl SecureChannel for LoopbackChannel {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let text = String::from_utf8_lossy(&frame);
        if lock(&self.failing_frames)
            .iter()
            .any(|needle| text.contains(needle.as_str()))
        {
            return Err(ChannelError::Network("injected send failure".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ChannelError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.try_send(ChannelEvent::Closed { remote: false });
        }
    }
}

/// The server's side of one loopback connection.
pub struct ServerEnd {
    channel: Arc<LoopbackChannel>,
    outbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl ServerEnd {
    pub async fn inject(&self, node: &Node) {
        let frame = JsonCodec
            .encode(node)
            .expect("test nodes always encode");
        self.inject_raw(frame).await;
    }

    pub async fn inject_raw(&self, frame: impl Into<Bytes>) {
        self.channel
            .events
            .send(ChannelEvent::Frame(frame.into()))
            .await
            .expect("client read loop should be alive");
    }

    /// Drops the connection from the server side.
    pub async fn close_remote(&self) {
        if self.channel.connected.swap(false, Ordering::SeqCst) {
            let _ = self
                .channel
                .events
                .send(ChannelEvent::Closed { remote: true })
                .await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.connected.load(Ordering::SeqCst)
    }

    /// Makes every outbound frame containing `needle` fail to send.
    pub fn fail_frames_containing(&self, needle: &str) {
        lock(&self.channel.failing_frames).push(needle.to_string());
    }

    /// Next node the client sent, or `None` if nothing arrives in time.
    pub async fn next_node(&self) -> Option<Node> {
        self.next_node_within(WAIT).await
    }

    pub async fn next_node_within(&self, within: Duration) -> Option<Node> {
        let frame = timeout(within, self.outbound.lock().await.recv())
            .await
            .ok()??;
        Some(JsonCodec.decode(&frame).expect("client sent an undecodable frame"))
    }

    /// Skips sent nodes until one matches `predicate`.
    pub async fn next_node_matching(&self, predicate: impl Fn(&Node) -> bool) -> Option<Node> {
        self.next_node_matching_within(predicate, WAIT).await
    }

    pub async fn next_node_matching_within(
        &self,
        predicate: impl Fn(&Node) -> bool,
        within: Duration,
    ) -> Option<Node> {
        let deadline = Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let node = self.next_node_within(left).await?;
            if predicate(&node) {
                return Some(node);
            }
        }
    }

    /// Answers the client's next iq with an empty result.
    pub async fn reply_to_next_iq(&self) -> Option<Node> {
        self.reply_to_next_iq_within(WAIT).await
    }

    pub async fn reply_to_next_iq_within(&self, within: Duration) -> Option<Node> {
        let iq = self
            .next_node_matching_within(|n| n.tag == "iq", within)
            .await?;
        self.reply_result(&iq).await;
        Some(iq)
    }

    /// Answers `iq` with an empty result.
    pub async fn reply_result(&self, iq: &Node) {
        let id = iq.attrs.get("id").cloned().unwrap_or_default();
        self.inject(
            &NodeBuilder::new("iq")
                .attrs([("from", SERVER_JID), ("id", id.as_str()), ("type", "result")])
                .build(),
        )
        .await;
    }
}

/// The `xmlns="passive"` iq a client sends after login.
pub fn is_passive_iq(node: &Node) -> bool {
    node.tag == "iq" && node.attrs.get("xmlns").map(String::as_str) == Some("passive")
}

/// `<iq type="set"><pair-device><ref>..</ref>..</pair-device></iq>` as the server sends it.
pub fn pair_device_iq(id: &str, refs: &[&str]) -> Node {
    NodeBuilder::new("iq")
        .attrs([("from", SERVER_JID), ("id", id), ("type", "set"), ("xmlns", "md")])
        .children([NodeBuilder::new("pair-device")
            .children(
                refs.iter()
                    .map(|r| NodeBuilder::new("ref").bytes(r.as_bytes()).build()),
            )
            .build()])
        .build()
}

/// A `pair-success` iq carrying `device_identity` as its signed container.
pub fn pair_success_iq(id: &str, device_identity: Vec<u8>, jid: &str, lid: Option<&str>) -> Node {
    let mut device = NodeBuilder::new("device").attr("jid", jid);
    if let Some(lid) = lid {
        device = device.attr("lid", lid);
    }
    NodeBuilder::new("iq")
        .attrs([("from", SERVER_JID), ("id", id), ("type", "set"), ("xmlns", "md")])
        .children([NodeBuilder::new("pair-success")
            .children([
                NodeBuilder::new("device-identity")
                    .bytes(device_identity)
                    .build(),
                NodeBuilder::new("biz").attr("name", "Acme").build(),
                device.build(),
                NodeBuilder::new("platform").attr("name", "android").build(),
            ])
            .build()])
        .build()
}

/// Opens loopback connections. Connect results can be scripted ahead of time.
#[derive(Default)]
pub struct LoopbackChannelFactory {
    script: StdMutex<VecDeque<ChannelError>>,
    attempts: StdMutex<Vec<Instant>>,
    servers: StdMutex<Vec<Arc<ServerEnd>>>,
    opened: Notify,
}

impl LoopbackChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connect attempts fail with `error`.
    pub fn fail_next(&self, count: usize, error: ChannelError) {
        let mut script = lock(&self.script);
        script.extend(std::iter::repeat_n(error, count));
    }

    pub fn attempts(&self) -> Vec<Instant> {
        lock(&self.attempts).clone()
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.attempts).len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.servers).len()
    }

    pub fn latest_server(&self) -> Option<Arc<ServerEnd>> {
        lock(&self.servers).last().cloned()
    }

    /// Waits until at least `n` connections have been opened and returns the `n`th.
    pub async fn server(&self, n: usize) -> Arc<ServerEnd> {
        self.server_within(n, WAIT).await
    }

    pub async fn server_within(&self, n: usize, within: Duration) -> Arc<ServerEnd> {
        let deadline = Instant::now() + within;
        loop {
            let opened = self.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();
            if let Some(server) = lock(&self.servers).get(n - 1).cloned() {
                return server;
            }
            tokio::time::timeout_at(deadline, opened)
                .await
                .unwrap_or_else(|_| panic!("connection #{n} was never opened"));
        }
    }
}

#[async_trait]
impl SecureChannelFactory for LoopbackChannelFactory {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SecureChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        lock(&self.attempts).push(Instant::now());
        if let Some(error) = lock(&self.script).pop_front() {
            return Err(error);
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(LoopbackChannel {
            connected: AtomicBool::new(true),
            events: event_tx,
            outbound: out_tx,
            failing_frames: StdMutex::default(),
        });
        lock(&self.servers).push(Arc::new(ServerEnd {
            channel: channel.clone(),
            outbound: Mutex::new(out_rx),
        }));
        self.opened.notify_waiters();
        Ok((channel, event_rx))
    }
}

/// Records every dispatched event.
#[derive(Default)]
pub struct EventRecorder {
    events: StdMutex<Vec<Event>>,
    changed: Notify,
}

impl EventHandler for EventRecorder {
    fn handle_event(&self, event: &Event) {
        lock(&self.events).push(event.clone());
        self.changed.notify_waiters();
    }
}

impl EventRecorder {
    pub fn all(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(Event::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// Waits until `n` events named `name` were recorded; returns the last one.
    pub async fn wait_for_nth(&self, name: &str, n: usize) -> Option<Event> {
        self.wait_for_nth_within(name, n, WAIT).await
    }

    pub async fn wait_for_nth_within(
        &self,
        name: &str,
        n: usize,
        within: Duration,
    ) -> Option<Event> {
        let deadline = Instant::now() + within;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if let Some(event) = lock(&self.events)
                .iter()
                .filter(|e| e.name() == name)
                .nth(n - 1)
                .cloned()
            {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }

    pub async fn wait_for(&self, name: &str) -> Option<Event> {
        self.wait_for_nth(name, 1).await
    }
}

/// A client wired to a loopback factory, a memory store and an event recorder.
pub struct TestClient {
    pub client: Arc<Client>,
    pub factory: Arc<LoopbackChannelFactory>,
    pub store: Arc<MemoryDeviceStore>,
    pub events: Arc<EventRecorder>,
}

impl TestClient {
    /// Unpaired device, default config.
    pub async fn new() -> Self {
        Self::build(MemoryDeviceStore::new(), |b| b)
    }

    /// A device already paired as `15550001111@s.whatsapp.net` / `987@lid`.
    pub async fn paired() -> Self {
        Self::paired_with(|b| b)
    }

    pub fn paired_with(customize: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Self {
        let store = MemoryDeviceStore::paired(
            "15550001111@s.whatsapp.net"
                .parse()
                .expect("valid jid"),
            Some("987@lid".parse().expect("valid jid")),
        );
        Self::build(store, customize)
    }

    pub fn build(
        store: MemoryDeviceStore,
        customize: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Self {
        let factory = Arc::new(LoopbackChannelFactory::new());
        let store = Arc::new(store);
        let events = Arc::new(EventRecorder::default());
        let builder = Client::builder(store.clone(), factory.clone(), Arc::new(JsonCodec))
            .with_id_generator(Arc::new(CounterIdGenerator::with_prefix("test")));
        let client = customize(builder).build();
        client.add_event_handler(events.clone());
        Self {
            client,
            factory,
            store,
            events,
        }
    }

    /// Config with fast timings for tests that run in real time.
    pub fn fast_config() -> ClientConfig {
        ClientConfig {
            reconnect_backoff_step: Duration::from_millis(10),
            default_request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    /// Connects and returns the server end of the new connection.
    pub async fn connect(&self) -> Arc<ServerEnd> {
        let before = self.factory.connection_count();
        self.client.connect().await.expect("connect should succeed");
        self.factory.server(before + 1).await
    }

    /// Connects, completes login with a `<success>` stanza and acknowledges
    /// the client's switch to active mode.
    pub async fn login(&self) -> Arc<ServerEnd> {
        let server = self.connect().await;
        let connected_before = self.events.count("Connected");
        server.inject(&NodeBuilder::new("success").build()).await;
        self.events
            .wait_for_nth("Connected", connected_before + 1)
            .await
            .expect("login should emit Connected");
        let active = server
            .next_node_matching(is_passive_iq)
            .await
            .expect("login should leave passive mode");
        server.reply_result(&active).await;
        server
    }
}
