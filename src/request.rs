use crate::client::{Client, ClientError};
use crate::codec::CodecError;
use crate::transport::ChannelError;
use log::warn;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use wasession_core::binary::builder::NodeBuilder;
use wasession_core::binary::jid::Jid;
use wasession_core::binary::node::{Node, NodeContent};

/// Represents the type of an IQ stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Set,
    Get,
}

impl InfoQueryType {
    fn as_str(&self) -> &'static str {
        match self {
            InfoQueryType::Set => "set",
            InfoQueryType::Get => "get",
        }
    }
}

/// Defines an IQ request to be sent to the server.
#[derive(Debug, Clone)]
pub struct InfoQuery<'a> {
    pub namespace: &'a str,
    pub query_type: InfoQueryType,
    pub to: Jid,
    pub target: Option<Jid>,
    pub id: Option<String>,
    pub content: Option<NodeContent>,
    pub timeout: Option<Duration>,
}

impl<'a> InfoQuery<'a> {
    pub fn get(namespace: &'a str, to: Jid, content: Option<NodeContent>) -> Self {
        Self::new(namespace, InfoQueryType::Get, to, content)
    }

    pub fn set(namespace: &'a str, to: Jid, content: Option<NodeContent>) -> Self {
        Self::new(namespace, InfoQueryType::Set, to, content)
    }

    fn new(
        namespace: &'a str,
        query_type: InfoQueryType,
        to: Jid,
        content: Option<NodeContent>,
    ) -> Self {
        Self {
            namespace,
            query_type,
            to,
            target: None,
            id: None,
            content,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Custom error types for IQ operations.
#[derive(Debug, Error)]
pub enum IqError {
    #[error("IQ request timed out")]
    Timeout,
    #[error("Client is not connected")]
    NotConnected,
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Received disconnect node during IQ wait: {0:?}")]
    Disconnected(Node),
    #[error("Received a server error response: code={code}, text='{text}'")]
    ServerError { code: u16, text: String },
    #[error("Internal channel closed unexpectedly")]
    InternalChannelClosed,
}

impl From<ClientError> for IqError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Channel(e) => IqError::Channel(e),
            ClientError::Codec(e) => IqError::Codec(e),
            _ => IqError::NotConnected,
        }
    }
}

impl Client {
    /// Generates a new unique request ID string.
    pub fn generate_request_id(&self) -> String {
        self.id_generator.next_id()
    }

    /// Sends an IQ (Info/Query) stanza and asynchronously waits for a response.
    pub async fn send_iq(&self, query: InfoQuery<'_>) -> Result<Node, IqError> {
        let req_id = query
            .id
            .clone()
            .unwrap_or_else(|| self.generate_request_id());

        let mut builder = NodeBuilder::new("iq").attrs([
            ("id", req_id.clone()),
            ("xmlns", query.namespace.to_string()),
            ("type", query.query_type.as_str().to_string()),
            ("to", query.to.to_string()),
        ]);
        if let Some(target) = query.target.filter(|t| !t.is_empty()) {
            builder = builder.attr("target", target.to_string());
        }
        let mut node = builder.build();
        node.content = query.content;

        let rx = self.register_waiter(&req_id).await;
        if let Err(e) = self.send_node(node).await {
            self.response_waiters.lock().await.remove(&req_id);
            return Err(e.into());
        }

        let deadline = query.timeout.unwrap_or(self.config.default_request_timeout);
        match timeout(deadline, rx).await {
            Ok(Ok(response_node)) => parse_iq_response(response_node),
            Ok(Err(_)) => Err(IqError::InternalChannelClosed),
            Err(_) => {
                self.response_waiters.lock().await.remove(&req_id);
                Err(IqError::Timeout)
            }
        }
    }

    async fn register_waiter(&self, req_id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .await
            .insert(req_id.to_string(), tx);
        rx
    }

    /// Hands `node` to the task waiting for its id, or gives it back if nobody is waiting.
    pub(crate) async fn handle_iq_response(&self, node: Node) -> Result<(), Node> {
        let Some(id) = node.attrs.get("id").cloned() else {
            return Err(node);
        };
        let Some(waiter) = self.response_waiters.lock().await.remove(&id) else {
            return Err(node);
        };
        if waiter.send(node).is_err() {
            warn!(target: "Client/IQ", "Failed to send IQ response to waiter for ID {id}. Receiver was likely dropped.");
        }
        Ok(())
    }

    /// Completes every pending request with `node` (a stream end or stream error).
    pub(crate) async fn clear_response_waiters(&self, node: Node) {
        let waiters: Vec<_> = self.response_waiters.lock().await.drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(node.clone());
        }
    }

    pub async fn pending_request_count(&self) -> usize {
        self.response_waiters.lock().await.len()
    }
}

fn parse_iq_response(response_node: Node) -> Result<Node, IqError> {
    if response_node.tag == "stream:error" || response_node.tag == "xmlstreamend" {
        return Err(IqError::Disconnected(response_node));
    }

    if response_node.attrs.get("type").map(String::as_str) == Some("error") {
        let Some(error_node) = response_node.get_optional_child("error") else {
            return Err(IqError::ServerError {
                code: 0,
                text: "Malformed error response".to_string(),
            });
        };
        let mut parser = error_node.attrs();
        let code = parser.optional_u64("code").unwrap_or(0) as u16;
        let text = parser.optional_string("text").unwrap_or("").to_string();
        if !parser.ok() {
            warn!(
                target: "Client/IQ",
                "Attribute parsing errors in IQ error response: {:?}",
                parser.errors
            );
        }
        return Err(IqError::ServerError { code, text });
    }
    Ok(response_node)
}
