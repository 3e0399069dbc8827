use crate::client::Client;
use crate::types::events::{
    CatRefreshError, ClientOutdated, ConnectFailure, ConnectFailureReason, Event, LoggedOut,
    ManualLoginReconnect, StreamError, StreamReplaced, TemporaryBan,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use wasession_core::binary::node::Node;
use wasession_core::stream::{ConnectFailureAction, ConnectFailureInfo, StreamErrorAction};

impl Client {
    pub(crate) async fn handle_stream_error(self: &Arc<Self>, node: &Node) {
        self.is_logged_in.store(false, Ordering::Relaxed);
        self.clear_response_waiters(node.clone()).await;

        match StreamErrorAction::classify(node) {
            StreamErrorAction::RestartRequired => {
                if self.config.disable_login_auto_reconnect {
                    info!(target: "Client", "Got 515 code, but login auto reconnect is disabled");
                    self.expected_disconnect.set();
                    self.dispatch_event(Event::ManualLoginReconnect(ManualLoginReconnect));
                    return;
                }
                info!(target: "Client", "Got 515 code, reconnecting...");
                let client = self.clone();
                tokio::spawn(async move {
                    client.disconnect().await;
                    if let Err(e) = client.establish().await {
                        error!(target: "Client", "Failed to reconnect after 515 code: {e}");
                    }
                });
            }
            StreamErrorAction::DeviceRemoved => {
                info!(target: "Client", "Got device removed stream error, sending LoggedOut event and deleting session");
                self.expected_disconnect.set();
                self.dispatch_event(Event::LoggedOut(LoggedOut {
                    on_connect: false,
                    reason: ConnectFailureReason::LoggedOut,
                }));
                if let Err(e) = self.store.delete_device().await {
                    warn!(target: "Client", "Failed to delete store after device_removed error: {e}");
                }
            }
            StreamErrorAction::Replaced => {
                info!(target: "Client", "Got replaced stream error, sending StreamReplaced event");
                self.expected_disconnect.set();
                self.dispatch_event(Event::StreamReplaced(StreamReplaced));
            }
            StreamErrorAction::ServiceUnavailable => {
                info!(target: "Client", "Got 503 stream error, assuming automatic reconnect will handle it");
            }
            StreamErrorAction::CredentialRefresh { code } if self.credential_refresher.is_some() => {
                info!(target: "Client", "Got {code} stream error, refreshing client auth token");
                self.spawn_credential_refresh();
            }
            StreamErrorAction::CredentialRefresh { code } | StreamErrorAction::Unknown { code } => {
                error!(target: "Client", "Unknown stream error code {code:?}: {node:?}");
                self.dispatch_event(Event::StreamError(StreamError {
                    code,
                    raw: Some(node.clone()),
                }));
            }
        }
    }

    pub(crate) async fn handle_connect_failure(self: &Arc<Self>, node: &Node) {
        let info = ConnectFailureInfo::from_node(node);
        let reason = info.reason;
        let allows_reconnect = info.allows_reconnect();

        match info.action {
            ConnectFailureAction::LoggedOut(reason) => {
                info!(target: "Client", "Got {} connect failure, sending LoggedOut event and deleting session", reason.code());
                self.expected_disconnect.set();
                self.dispatch_event(Event::LoggedOut(LoggedOut {
                    on_connect: true,
                    reason,
                }));
                if let Err(e) = self.store.delete_device().await {
                    warn!(target: "Client", "Failed to delete store after {} failure: {e}", reason.code());
                }
            }
            ConnectFailureAction::TemporaryBan { code, expire } => {
                warn!(target: "Client", "Temporary ban connect failure ({code}), expires in {expire:?}");
                self.expected_disconnect.set();
                self.dispatch_event(Event::TemporaryBan(TemporaryBan { code, expire }));
            }
            ConnectFailureAction::ClientOutdated => {
                error!(target: "Client", "Client outdated (405) connect failure");
                self.expected_disconnect.set();
                self.dispatch_event(Event::ClientOutdated(ClientOutdated));
            }
            ConnectFailureAction::CredentialRefresh(reason)
                if self.credential_refresher.is_some() =>
            {
                info!(target: "Client", "Got {} connect failure, refreshing client auth token", reason.code());
                self.spawn_credential_refresh();
            }
            _ if allows_reconnect => {
                debug!(target: "Client", "Got {} connect failure, waiting for automatic reconnect", reason.code());
            }
            action => {
                let message = match action {
                    ConnectFailureAction::Other { message, .. } => message,
                    _ => String::new(),
                };
                warn!(target: "Client", "Unknown connect failure {}: {message}", reason.code());
                self.expected_disconnect.set();
                self.dispatch_event(Event::ConnectFailure(ConnectFailure {
                    reason,
                    message,
                    raw: Some(node.clone()),
                }));
            }
        }
    }

    /// Runs the credential refresher while holding the connection lock shared,
    /// so no reconnect swaps the channel underneath it.
    fn spawn_credential_refresh(self: &Arc<Self>) {
        let Some(refresher) = self.credential_refresher.clone() else {
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            let result = {
                let _connection = client.channel.read().await;
                refresher.refresh().await
            };
            match result {
                Ok(()) => info!(target: "Client", "Client auth token refreshed"),
                Err(e) => {
                    error!(target: "Client", "Failed to refresh client auth token: {e:#}");
                    client.expected_disconnect.set();
                    client.dispatch_event(Event::CatRefreshError(CatRefreshError {
                        error: e.to_string(),
                    }));
                }
            }
        });
    }
}
