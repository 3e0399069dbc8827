use crate::client::ClientError;
use async_trait::async_trait;
use wasession_core::binary::jid::Jid;

/// Consulted after pairing crypto succeeds and before anything is stored.
#[async_trait]
pub trait PrePairHook: Send + Sync {
    async fn allow(&self, jid: &Jid, platform: &str, business_name: &str) -> bool;
}

/// Accepts every pairing.
pub struct AllowAllPairs;

#[async_trait]
impl PrePairHook for AllowAllPairs {
    async fn allow(&self, _jid: &Jid, _platform: &str, _business_name: &str) -> bool {
        true
    }
}

/// Decides whether the auto-reconnect loop keeps going after a failed attempt.
pub trait AutoReconnectHook: Send + Sync {
    fn should_retry(&self, error: &ClientError) -> bool;
}

pub struct AlwaysRetry;

impl AutoReconnectHook for AlwaysRetry {
    fn should_retry(&self, _error: &ClientError) -> bool {
        true
    }
}

impl<F> AutoReconnectHook for F
where
    F: Fn(&ClientError) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &ClientError) -> bool {
        self(error)
    }
}

/// Renews the client auth token after the server reports it expired or invalid.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<()>;
}
