use tokio::sync::watch;

/// Set before an intentional teardown so that the close callback neither emits
/// `Disconnected` nor starts auto-reconnect. Cleared when a new connection is
/// opened. Outlives individual connections.
#[derive(Debug)]
pub struct ExpectedDisconnect {
    tx: watch::Sender<bool>,
}

impl Default for ExpectedDisconnect {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }
}

impl ExpectedDisconnect {
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|expected| *expected).await;
    }
}
