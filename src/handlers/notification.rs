use super::traits::StanzaHandler;
use crate::client::Client;
use crate::types::events::Event;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use wasession_core::binary::node::Node;

/// Handler for `<notification>` stanzas. The session layer does not interpret
/// them; consumers get the raw node.
#[derive(Default)]
pub struct NotificationHandler;

#[async_trait]
impl StanzaHandler for NotificationHandler {
    fn tag(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, client: Arc<Client>, node: Arc<Node>) -> bool {
        let kind = node.attrs.get("type").map(String::as_str).unwrap_or("");
        debug!(target: "Client", "Passing through <notification type='{kind}'>");
        client.dispatch_event(Event::Notification(Arc::unwrap_or_clone(node)));
        true
    }
}
