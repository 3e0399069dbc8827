use crate::codec::{CodecError, WireCodec};
use crate::config::ClientConfig;
use crate::disconnect::ExpectedDisconnect;
use crate::dispatcher::{FrameDispatcher, NodeSink};
use crate::handlers::router::StanzaRouter;
use crate::hooks::{AllowAllPairs, AlwaysRetry, AutoReconnectHook, CredentialRefresher, PrePairHook};
use crate::id::{CounterIdGenerator, IdGenerator};
use crate::pair::{PairingCoordinator, PairingSession};
use crate::request::{InfoQuery, IqError};
use crate::store::{Backend, StoreError};
use crate::transport::{ChannelError, ChannelEvent, SecureChannel, SecureChannelFactory};
use crate::types::events::{Connected, CoreEventBus, Disconnected, Event, EventHandler, HandlerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use wasession_core::binary::builder::NodeBuilder;
use wasession_core::binary::jid::Jid;
use wasession_core::binary::node::{Node, NodeContent};
use wasession_core::xml::DisplayableNode;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("request failed: {0}")]
    Iq(#[from] IqError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Channel and handshake are up; waiting for `<success>`.
    AwaitingAuth,
    LoggedIn,
}

/// The one live channel and everything scoped to it.
pub(crate) struct ActiveChannel {
    pub(crate) channel: Arc<dyn SecureChannel>,
    pub(crate) cancel: CancellationToken,
    pub(crate) dispatcher: FrameDispatcher,
}

/// Hands queued stanzas to the router. Holds the client weakly so the drain
/// task does not keep it alive.
struct RouterSink {
    router: Arc<StanzaRouter>,
    client: Weak<Client>,
}

#[async_trait]
impl NodeSink for RouterSink {
    fn accepts(&self, tag: &str) -> bool {
        self.router.has_handler(tag)
    }

    async fn process(&self, node: Node) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let node = Arc::new(node);
        if !self.router.dispatch(client, node.clone()).await {
            warn!(target: "Client", "Received unknown top-level node: {}", DisplayableNode(&node));
        }
    }
}

pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) event_bus: CoreEventBus,
    pub(crate) store: Arc<dyn Backend>,
    pub(crate) channel_factory: Arc<dyn SecureChannelFactory>,
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
    pub(crate) auto_reconnect_hook: Arc<dyn AutoReconnectHook>,
    pub(crate) credential_refresher: Option<Arc<dyn CredentialRefresher>>,

    pub(crate) channel: RwLock<Option<ActiveChannel>>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) is_connecting: AtomicBool,
    pub(crate) is_logged_in: AtomicBool,
    pub(crate) expected_disconnect: ExpectedDisconnect,
    /// Makes the next locally initiated close behave like a remote one.
    pub(crate) force_auto_reconnect: AtomicBool,
    pub(crate) reconnect_running: AtomicBool,
    /// Parent of every per-connection token. Only `shutdown()` cancels it.
    pub(crate) shutdown_token: CancellationToken,

    pub enable_auto_reconnect: AtomicBool,
    pub auto_reconnect_errors: AtomicU32,
    pub last_successful_connect: Mutex<Option<DateTime<Utc>>>,

    pub(crate) response_waiters: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    pub(crate) router: Arc<StanzaRouter>,
    pub(crate) pairing: PairingCoordinator,
}

pub struct ClientBuilder {
    config: ClientConfig,
    store: Arc<dyn Backend>,
    channel_factory: Arc<dyn SecureChannelFactory>,
    codec: Arc<dyn WireCodec>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    pre_pair_hook: Arc<dyn PrePairHook>,
    auto_reconnect_hook: Arc<dyn AutoReconnectHook>,
    credential_refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    pub fn with_pre_pair_hook(mut self, hook: Arc<dyn PrePairHook>) -> Self {
        self.pre_pair_hook = hook;
        self
    }

    pub fn with_auto_reconnect_hook(mut self, hook: Arc<dyn AutoReconnectHook>) -> Self {
        self.auto_reconnect_hook = hook;
        self
    }

    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.credential_refresher = Some(refresher);
        self
    }

    pub fn build(self) -> Arc<Client> {
        Arc::new(Client {
            enable_auto_reconnect: AtomicBool::new(self.config.enable_auto_reconnect),
            config: self.config,
            event_bus: CoreEventBus::new(),
            store: self.store,
            channel_factory: self.channel_factory,
            codec: self.codec,
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Arc::new(CounterIdGenerator::new())),
            auto_reconnect_hook: self.auto_reconnect_hook,
            credential_refresher: self.credential_refresher,

            channel: RwLock::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
            is_connecting: AtomicBool::new(false),
            is_logged_in: AtomicBool::new(false),
            expected_disconnect: ExpectedDisconnect::default(),
            force_auto_reconnect: AtomicBool::new(false),
            reconnect_running: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),

            auto_reconnect_errors: AtomicU32::new(0),
            last_successful_connect: Mutex::new(None),

            response_waiters: Mutex::new(HashMap::new()),
            router: Arc::new(Client::create_stanza_router()),
            pairing: PairingCoordinator::new(self.pre_pair_hook),
        })
    }
}

impl Client {
    pub fn builder(
        store: Arc<dyn Backend>,
        channel_factory: Arc<dyn SecureChannelFactory>,
        codec: Arc<dyn WireCodec>,
    ) -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::default(),
            store,
            channel_factory,
            codec,
            id_generator: None,
            pre_pair_hook: Arc::new(AllowAllPairs),
            auto_reconnect_hook: Arc::new(AlwaysRetry),
            credential_refresher: None,
        }
    }

    pub(crate) fn create_stanza_router() -> StanzaRouter {
        use crate::handlers::{
            basic::{FailureHandler, StreamErrorHandler, SuccessHandler},
            ib::IbHandler,
            iq::IqHandler,
            notification::NotificationHandler,
            unimplemented::UnimplementedHandler,
        };

        let mut router = StanzaRouter::new();

        router.register(Arc::new(IqHandler));
        router.register(Arc::new(SuccessHandler));
        router.register(Arc::new(FailureHandler));
        router.register(Arc::new(StreamErrorHandler));
        router.register(Arc::new(IbHandler));
        router.register(Arc::new(NotificationHandler));

        for handler in UnimplementedHandler::all() {
            router.register(Arc::new(handler));
        }

        router
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Backend> {
        self.store.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(target: "Client", "Connection state {previous:?} -> {state:?}");
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::AwaitingAuth | ConnectionState::LoggedIn
        )
    }

    pub fn is_logged_in(&self) -> bool {
        self.is_logged_in.load(Ordering::Relaxed)
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.event_bus.add_handler(handler)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.event_bus.remove_handler(id)
    }

    pub fn remove_all_event_handlers(&self) {
        self.event_bus.remove_all_handlers()
    }

    pub fn dispatch_event(&self, event: Event) {
        self.event_bus.dispatch(&event);
    }

    /// Connects to the server.
    ///
    /// With `initial_auto_reconnect` and auto-reconnect enabled, a retryable
    /// failure is reported as success and the reconnect loop takes over in
    /// the background.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        match self.establish().await {
            Err(ClientError::Channel(e))
                if self.config.initial_auto_reconnect
                    && self.enable_auto_reconnect.load(Ordering::Relaxed)
                    && e.is_retryable() =>
            {
                warn!(target: "Client", "Initial connection failed but reconnecting in background ({e})");
                self.dispatch_event(Event::Disconnected(Disconnected));
                self.spawn_auto_reconnect();
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        let mut slot = self.channel.write().await;
        if slot.as_ref().is_some_and(|active| active.channel.is_connected()) {
            return Err(ClientError::AlreadyConnected);
        }
        if let Some(stale) = slot.take() {
            debug!(target: "Client", "Tearing down stale channel before connecting");
            stale.cancel.cancel();
            stale.channel.stop().await;
        }

        self.expected_disconnect.clear();
        self.is_logged_in.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        info!(target: "Client", "Opening secure channel...");
        let (channel, events) = match self.channel_factory.connect().await {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        let cancel = self.shutdown_token.child_token();
        let dispatcher = FrameDispatcher::start(
            (&self.config).into(),
            Arc::new(RouterSink {
                router: self.router.clone(),
                client: Arc::downgrade(self),
            }),
            cancel.clone(),
        );
        *slot = Some(ActiveChannel {
            channel: channel.clone(),
            cancel: cancel.clone(),
            dispatcher: dispatcher.clone(),
        });
        drop(slot);
        self.set_state(ConnectionState::AwaitingAuth);
        info!(target: "Client", "Secure channel established, waiting for authentication");

        tokio::spawn(self.clone().read_loop(channel, events, dispatcher, cancel));
        Ok(())
    }

    /// Intentionally closes the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut slot = self.channel.write().await;
        self.expected_disconnect.set();
        if let Some(active) = slot.take() {
            info!(target: "Client", "Disconnecting client intentionally.");
            active.cancel.cancel();
            active.channel.stop().await;
        }
        drop(slot);

        self.is_logged_in.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
        self.clear_response_waiters(stream_end_node()).await;
        self.pairing.clear_session().await;
    }

    /// Drops the current channel and lets auto-reconnect open a new one.
    pub async fn reset_connection(&self) {
        self.force_auto_reconnect.store(true, Ordering::SeqCst);
        let channel = self
            .channel
            .read()
            .await
            .as_ref()
            .map(|active| active.channel.clone());
        if let Some(channel) = channel {
            info!(target: "Client", "Resetting connection");
            channel.stop().await;
        }
    }

    /// Stops every background task for good, auto-reconnect included.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.disconnect().await;
    }

    /// Called when a channel reports that it closed. Closes of anything but
    /// the active channel are ignored.
    pub async fn on_channel_closed(
        self: &Arc<Self>,
        channel: &Arc<dyn SecureChannel>,
        remote: bool,
    ) {
        let mut slot = self.channel.write().await;
        if !slot
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.channel, channel))
        {
            debug!(target: "Client", "Ignoring close of an inactive channel");
            return;
        }
        if let Some(active) = slot.take() {
            active.cancel.cancel();
        }
        drop(slot);

        self.is_logged_in.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
        self.clear_response_waiters(stream_end_node()).await;

        let forced = self.force_auto_reconnect.swap(false, Ordering::SeqCst);
        if !self.expected_disconnect.is_set() && (remote || forced) {
            info!(target: "Client", "Channel closed unexpectedly (remote: {remote}, forced: {forced})");
            self.dispatch_event(Event::Disconnected(Disconnected));
            self.spawn_auto_reconnect();
        } else {
            debug!(target: "Client", "Channel closed (remote: {remote}), not reconnecting");
        }
    }

    pub(crate) fn spawn_auto_reconnect(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move { client.auto_reconnect().await });
    }

    async fn auto_reconnect(self: &Arc<Self>) {
        if !self.enable_auto_reconnect.load(Ordering::Relaxed) {
            debug!(target: "Client/Reconnect", "Auto-reconnect disabled");
            return;
        }
        match self.store.load_device().await {
            Ok(device) if device.is_paired() => {}
            Ok(_) => {
                debug!(target: "Client/Reconnect", "Device is not paired, not reconnecting");
                return;
            }
            Err(e) => {
                warn!(target: "Client/Reconnect", "Failed to load device, not reconnecting: {e}");
                return;
            }
        }
        if self.reconnect_running.swap(true, Ordering::SeqCst) {
            debug!(target: "Client/Reconnect", "Auto-reconnect loop already running");
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.reconnect_running.store(false, Ordering::SeqCst);
        });

        loop {
            let errors = self.auto_reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = self.config.reconnect_backoff_step * errors;
            debug!(target: "Client/Reconnect", "Automatically reconnecting after {delay:?}");

            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    debug!(target: "Client/Reconnect", "Client shut down, cancelling reconnect");
                    return;
                }
                _ = self.expected_disconnect.wait() => {
                    debug!(target: "Client/Reconnect", "Expected disconnect, cancelling reconnect");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(()) => {
                    info!(target: "Client/Reconnect", "Reconnected");
                    return;
                }
                Err(ClientError::AlreadyConnected) => {
                    debug!(target: "Client/Reconnect", "Connection was already re-established");
                    return;
                }
                Err(e) => {
                    if self.expected_disconnect.is_set() {
                        debug!(target: "Client/Reconnect", "Disconnect expected after reconnect error ({e}), stopping");
                        return;
                    }
                    error!(target: "Client/Reconnect", "Error reconnecting after autoreconnect sleep: {e}");
                    if !self.auto_reconnect_hook.should_retry(&e) {
                        debug!(target: "Client/Reconnect", "Auto-reconnect hook declined further attempts");
                        return;
                    }
                }
            }
        }
    }

    /// Waits until the client is connected and logged in. Returns false on
    /// timeout or once a disconnect is expected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            ready = state.wait_for(|s| *s == ConnectionState::LoggedIn) => ready.is_ok(),
            _ = self.expected_disconnect.wait() => false,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        channel: Arc<dyn SecureChannel>,
        mut events: mpsc::Receiver<ChannelEvent>,
        dispatcher: FrameDispatcher,
        cancel: CancellationToken,
    ) {
        debug!(target: "Client", "Starting frame read loop");
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "Client", "Connection cancelled, exiting read loop");
                    return;
                }
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Frame(frame)) => self.handle_frame(&frame, &dispatcher).await,
                Some(ChannelEvent::Closed { remote }) => {
                    self.on_channel_closed(&channel, remote).await;
                    return;
                }
                None => {
                    debug!(target: "Client", "Channel event stream ended");
                    self.on_channel_closed(&channel, true).await;
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8], dispatcher: &FrameDispatcher) {
        let node = match self.codec.decode(frame) {
            Ok(node) => node,
            Err(e) => {
                warn!(target: "Client/Recv", "Failed to decode frame: {e}");
                debug!(target: "Client/Recv", "Undecodable frame: {}", hex::encode(frame));
                return;
            }
        };
        info!(target: "Client/Recv", "{}", DisplayableNode(&node));

        if node.tag == "xmlstreamend" {
            if self.expected_disconnect.is_set() {
                debug!(target: "Client", "Received <xmlstreamend/>, expected disconnect.");
            } else {
                warn!(target: "Client", "Received stream end frame");
            }
            return;
        }

        if let Err(node) = self.handle_iq_response(node).await {
            dispatcher.enqueue(node);
        }
    }

    pub(crate) async fn handle_success(self: &Arc<Self>, node: &Node) {
        info!(target: "Client", "Successfully authenticated");
        *self.last_successful_connect.lock().await = Some(Utc::now());
        self.auto_reconnect_errors.store(0, Ordering::SeqCst);
        self.is_logged_in.store(true, Ordering::Relaxed);

        if let Err(e) = self.adopt_server_lid(node).await {
            warn!(target: "Client", "Failed to update LID after login: {e}");
        }

        let cancel = self
            .channel
            .read()
            .await
            .as_ref()
            .map(|active| active.cancel.clone());
        if let Some(cancel) = cancel {
            tokio::spawn(self.clone().keepalive_loop(cancel));
        }

        let client = self.clone();
        tokio::spawn(async move {
            if !client.is_connected() {
                debug!(target: "Client", "Connection closed before leaving passive mode");
                return;
            }
            if let Err(e) = client.set_passive(false).await {
                warn!(target: "Client", "Failed to send post-connect active IQ: {e}");
            }
        });

        self.dispatch_event(Event::Connected(Connected));
        self.set_state(ConnectionState::LoggedIn);
    }

    async fn adopt_server_lid(&self, node: &Node) -> Result<(), StoreError> {
        let node_lid = node.attrs().optional_jid("lid").filter(|lid| !lid.is_empty());
        let mut device = self.store.load_device().await?;

        if let Some(node_lid) = node_lid {
            let changed = match &device.lid {
                None => {
                    info!(target: "Client", "Adopting LID {node_lid} from login");
                    true
                }
                Some(stored) if *stored != node_lid => {
                    warn!(target: "Client", "Stored LID {stored} differs from server's {node_lid}, replacing it");
                    true
                }
                Some(_) => false,
            };
            if changed {
                device.lid = Some(node_lid);
                self.store.save_device(&device).await?;
            }
        }

        if let (Some(lid), Some(pn)) = (&device.lid, &device.id) {
            self.store.put_lid_pn_mapping(lid, pn).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_iq(self: &Arc<Self>, node: &Node) -> bool {
        if node.attrs.get("type").map(String::as_str) == Some("get")
            && node.get_optional_child("ping").is_some()
        {
            info!(target: "Client", "Received ping, sending pong.");
            let mut parser = node.attrs();
            let from = parser.optional_string("from").unwrap_or_default();
            let id = parser.optional_string("id").unwrap_or_default();
            let pong = NodeBuilder::new("iq")
                .attrs([("to", from), ("id", id), ("type", "result")])
                .build();
            if let Err(e) = self.send_node(pong).await {
                warn!(target: "Client", "Failed to send pong: {e}");
            }
            return true;
        }

        self.pairing.handle_iq(self, node).await
    }

    pub async fn send_node(&self, node: Node) -> Result<(), ClientError> {
        let channel = self
            .channel
            .read()
            .await
            .as_ref()
            .map(|active| active.channel.clone());
        let Some(channel) = channel else {
            return Err(ClientError::NotConnected);
        };

        info!(target: "Client/Send", "{}", DisplayableNode(&node));
        let frame = self.codec.encode(&node)?;
        channel.send_frame(frame).await?;
        Ok(())
    }

    /// Switches the server between passive and active delivery for this
    /// connection. Offline stanzas only flow once the client is active.
    pub async fn set_passive(&self, passive: bool) -> Result<(), IqError> {
        let tag = if passive { "passive" } else { "active" };
        self.send_iq(InfoQuery::set(
            "passive",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![NodeBuilder::new(tag).build()])),
        ))
        .await
        .map(|_| ())
    }

    /// Unlinks this companion from the account, then disconnects and forgets
    /// the pairing.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let device = self.store.load_device().await?;
        let Some(own_id) = device.id else {
            return Err(ClientError::NotLoggedIn);
        };

        let remove = NodeBuilder::new("remove-companion-device")
            .attrs([
                ("jid", own_id.to_string()),
                ("reason", "user_initiated".to_string()),
            ])
            .build();
        self.send_iq(InfoQuery::set(
            "md",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![remove])),
        ))
        .await?;

        self.disconnect().await;
        self.store.delete_device().await?;
        info!(target: "Client", "Logged out");
        Ok(())
    }

    /// The pairing currently being completed, if any.
    pub async fn pairing_session(&self) -> Option<PairingSession> {
        self.pairing.session().await
    }

    /// Dispatch statistics for the active connection, if any.
    pub async fn dispatcher_stats(&self) -> Option<crate::dispatcher::DispatcherStats> {
        self.channel
            .read()
            .await
            .as_ref()
            .map(|active| active.dispatcher.stats())
    }
}

pub(crate) fn stream_end_node() -> Node {
    NodeBuilder::new("xmlstreamend").build()
}
