pub use wasession_core::{binary, proto, xml};

pub mod types {
    pub use wasession_core::types::*;
}

pub mod client;
pub mod codec;
pub mod config;
pub mod disconnect;
pub mod dispatcher;
pub mod handlers;
pub mod hooks;
pub mod id;
pub mod keepalive;
pub mod pair;
pub mod request;
pub mod store;
pub mod stream;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod unified_session;

pub use client::{Client, ClientBuilder, ClientError, ConnectionState};
pub use config::ClientConfig;
