use super::traits::StanzaHandler;
use crate::client::Client;
use crate::types::events::Event;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use wasession_core::binary::node::Node;

/// Stanzas whose payload handling (decryption, receipts, calls) lives above
/// the session layer. They are surfaced as `Event::UnhandledStanza`.
pub struct UnimplementedHandler {
    tag: &'static str,
}

impl UnimplementedHandler {
    pub fn new(tag: &'static str) -> Self {
        Self { tag }
    }

    pub fn all() -> Vec<Self> {
        ["message", "receipt", "call", "chatstate", "presence"]
            .into_iter()
            .map(Self::new)
            .collect()
    }
}

#[async_trait]
impl StanzaHandler for UnimplementedHandler {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        debug!(target: "Client", "Surfacing <{}> without processing", self.tag);
        client.dispatch_event(Event::UnhandledStanza(Arc::unwrap_or_clone(node)));
        true
    }
}
