use super::traits::StanzaHandler;
use crate::client::Client;
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use wasession_core::binary::node::Node;
use wasession_core::xml::DisplayableNode;

/// Handler for `<iq>` stanzas the server initiates: pings and pairing.
#[derive(Default)]
pub struct IqHandler;

#[async_trait]
impl StanzaHandler for IqHandler {
    fn tag(&self) -> &'static str {
        "iq"
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        if !client.handle_iq(&node).await {
            warn!(target: "Client", "Received unhandled IQ: {}", DisplayableNode(&node));
        }
        true
    }
}
