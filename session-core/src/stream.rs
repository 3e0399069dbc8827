//! Classification of server-pushed `stream:error` and `failure` nodes.
//!
//! The runtime client decides *how* to act (locks, tasks, store deletion);
//! this module only decides *what* a node means.

use crate::types::events::{ConnectFailureReason, TempBanReason};
use std::time::Duration;
use wasession_binary::node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorAction {
    /// 515: the server wants a fresh connection.
    RestartRequired,
    /// 401 with a `device_removed` conflict.
    DeviceRemoved,
    /// Another session took over this device.
    Replaced,
    /// 503: the generic close path reconnects.
    ServiceUnavailable,
    /// Client auth token expired or invalid.
    CredentialRefresh { code: String },
    Unknown { code: String },
}

impl StreamErrorAction {
    pub fn classify(node: &Node) -> Self {
        let code = node
            .attrs
            .get("code")
            .map(String::as_str)
            .unwrap_or_default();
        let conflict_type = node
            .get_optional_child("conflict")
            .and_then(|n| n.attrs.get("type"))
            .map(String::as_str)
            .unwrap_or_default();

        match (code, conflict_type) {
            ("515", _) => Self::RestartRequired,
            ("401", "device_removed") => Self::DeviceRemoved,
            (_, "replaced") => Self::Replaced,
            ("503", _) => Self::ServiceUnavailable,
            ("413" | "414", _) => Self::CredentialRefresh {
                code: code.to_string(),
            },
            _ => Self::Unknown {
                code: code.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailureAction {
    LoggedOut(ConnectFailureReason),
    TemporaryBan { code: TempBanReason, expire: Duration },
    ClientOutdated,
    CredentialRefresh(ConnectFailureReason),
    Other {
        reason: ConnectFailureReason,
        message: String,
    },
}

/// A parsed `failure` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailureInfo {
    pub reason: ConnectFailureReason,
    pub action: ConnectFailureAction,
}

impl ConnectFailureInfo {
    pub fn from_node(node: &Node) -> Self {
        let mut attrs = node.attrs();
        let reason = ConnectFailureReason::from(attrs.optional_u64("reason").unwrap_or(0) as i32);

        let action = if reason.is_logged_out() {
            ConnectFailureAction::LoggedOut(reason)
        } else if reason == ConnectFailureReason::TempBanned {
            let code = attrs.optional_u64("code").unwrap_or(0) as i32;
            let expire = attrs.optional_u64("expire").unwrap_or(0);
            ConnectFailureAction::TemporaryBan {
                code: TempBanReason::from(code),
                expire: Duration::from_secs(expire),
            }
        } else if reason == ConnectFailureReason::ClientOutdated {
            ConnectFailureAction::ClientOutdated
        } else if reason.is_cat_failure() {
            ConnectFailureAction::CredentialRefresh(reason)
        } else {
            ConnectFailureAction::Other {
                reason,
                message: attrs
                    .optional_string("message")
                    .unwrap_or_default()
                    .to_string(),
            }
        };

        Self { reason, action }
    }

    /// Whether the generic close path may auto-reconnect after this failure.
    pub fn allows_reconnect(&self) -> bool {
        self.reason.should_reconnect()
    }
}
