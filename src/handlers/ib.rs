use super::traits::StanzaHandler;
use crate::client::Client;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use wasession_core::binary::node::Node;
use wasession_core::ib::event_for_child;

/// Handler for `<ib>` (inline bootstrap) stanzas.
#[derive(Default)]
pub struct IbHandler;

#[async_trait]
impl StanzaHandler for IbHandler {
    fn tag(&self) -> &'static str {
        "ib"
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        for child in node.children().unwrap_or_default() {
            match event_for_child(child) {
                Some(event) => {
                    info!(target: "Client", "Received <{}> in ib", child.tag);
                    client.dispatch_event(event);
                }
                None if child.tag == "edge_routing" || child.tag == "dirty" => {
                    info!(target: "Client", "Ignoring <{}> in ib", child.tag);
                }
                None => warn!(target: "Client", "Unhandled ib child: <{}>", child.tag),
            }
        }
        true
    }
}
