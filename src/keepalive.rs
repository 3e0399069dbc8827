use crate::client::Client;
use crate::request::{InfoQuery, IqError};
use crate::types::events::{Event, KeepAliveRestored, KeepAliveTimeout};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wasession_core::binary::builder::NodeBuilder;
use wasession_core::binary::jid::Jid;
use wasession_core::binary::node::NodeContent;

/// Result of one ping.
enum PingOutcome {
    Pong,
    Failed,
    /// The connection is gone; the loop should stop.
    Closed,
}

impl Client {
    async fn send_keepalive(&self) -> PingOutcome {
        if !self.is_connected() {
            return PingOutcome::Closed;
        }

        debug!(target: "Client/Keepalive", "Sending keepalive ping");
        let query = InfoQuery::get(
            "w:p",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![NodeBuilder::new("ping").build()])),
        )
        .with_timeout(self.config.keepalive_response_deadline);

        match self.send_iq(query).await {
            Ok(_) => PingOutcome::Pong,
            Err(IqError::NotConnected | IqError::Disconnected(_)) => PingOutcome::Closed,
            Err(e) => {
                warn!(target: "Client/Keepalive", "Keepalive ping failed: {e}");
                PingOutcome::Failed
            }
        }
    }

    fn next_keepalive_interval(&self) -> Duration {
        let min = self.config.keepalive_interval_min.as_millis() as u64;
        let max = (self.config.keepalive_interval_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Pings the server until `cancel` fires. Spawned once per login.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_success = chrono::Utc::now();
        let mut last_success_at = Instant::now();
        let mut error_count = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "Client/Keepalive", "Connection cancelled, exiting keepalive loop.");
                    return;
                }
                _ = tokio::time::sleep(self.next_keepalive_interval()) => {}
            }

            match self.send_keepalive().await {
                PingOutcome::Closed => {
                    debug!(target: "Client/Keepalive", "Not connected, exiting keepalive loop.");
                    return;
                }
                PingOutcome::Pong => {
                    if error_count > 0 {
                        info!(target: "Client/Keepalive", "Keepalive restored.");
                        error_count = 0;
                        self.dispatch_event(Event::KeepAliveRestored(KeepAliveRestored));
                    }
                    last_success = chrono::Utc::now();
                    last_success_at = Instant::now();
                }
                PingOutcome::Failed => {
                    error_count += 1;
                    warn!(target: "Client/Keepalive", "Keepalive timeout, error count: {error_count}");
                    self.dispatch_event(Event::KeepAliveTimeout(KeepAliveTimeout {
                        error_count,
                        last_success,
                    }));

                    if self.enable_auto_reconnect.load(Ordering::Relaxed)
                        && last_success_at.elapsed() > self.config.keepalive_max_fail_time
                    {
                        warn!(
                            target: "Client/Keepalive",
                            "Forcing reconnect due to keepalive failure for over {} seconds.",
                            self.config.keepalive_max_fail_time.as_secs()
                        );
                        self.reset_connection().await;
                        return;
                    }
                }
            }
        }
    }
}
