use crate::client::Client;
use log::{debug, warn};
use wasession_core::ib::build_unified_session_node;

impl Client {
    /// Sends the `ib/unified_session` marker that official clients send after
    /// linking. Failures are only logged.
    pub(crate) async fn send_unified_session(&self) {
        let node = build_unified_session_node(chrono::Utc::now().timestamp_millis());
        match self.send_node(node).await {
            Ok(()) => debug!(target: "Client", "Sent unified session"),
            Err(e) => warn!(target: "Client", "Failed to send unified session: {e}"),
        }
    }
}
