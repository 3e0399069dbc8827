use crate::client::Client;
use async_trait::async_trait;
use std::sync::Arc;
use wasession_core::binary::node::Node;

/// Trait for handling specific types of stanzas received from the server.
///
/// Each handler is responsible for one top-level tag (e.g. "iq", "success").
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    /// Returns the tag this handler is responsible for.
    fn tag(&self) -> &'static str;

    /// Returns `true` if the node was handled, `false` if it should be logged as unhandled.
    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool;
}
