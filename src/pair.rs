use crate::client::{Client, ClientError};
use crate::hooks::PrePairHook;
use crate::store::StoreError;
use crate::types::events::{self, Event, PairSuccess, Qr};
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use wasession_core::binary::jid::{Jid, SERVER_JID};
use wasession_core::binary::node::{Node, NodeContent};

pub use wasession_core::pair::{PairCryptoError, PairUtils, PrimaryDevice, VerifiedPairing};

#[derive(Debug, Error)]
pub enum PairError {
    #[error(transparent)]
    Crypto(#[from] PairCryptoError),
    #[error("pairing rejected locally")]
    RejectedLocally,
    #[error("failed to {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to send pairing confirmation: {0}")]
    Send(#[source] ClientError),
}

impl PairError {
    /// Code and text for the error iq sent back to the server, if one is sent.
    pub fn server_error(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::Crypto(e) => Some(e.server_error()),
            Self::RejectedLocally | Self::Database { .. } => Some((500, "internal-error")),
            Self::Send(_) => None,
        }
    }
}

fn database(context: &'static str) -> impl FnOnce(StoreError) -> PairError {
    move |source| PairError::Database { context, source }
}

/// What the server told us about the account in `pair-success`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    pub request_id: String,
    pub jid: Jid,
    pub lid: Option<Jid>,
    pub business_name: String,
    pub platform: String,
}

impl PairingSession {
    fn from_node(request_id: String, success: &Node) -> Self {
        let business_name = success
            .get_optional_child("biz")
            .and_then(|n| n.attrs().optional_string("name"))
            .unwrap_or_default()
            .to_string();
        let platform = success
            .get_optional_child("platform")
            .and_then(|n| n.attrs().optional_string("name"))
            .unwrap_or_default()
            .to_string();

        let (jid, lid) = match success.get_optional_child("device") {
            Some(device) => {
                let mut parser = device.attrs();
                let jid = parser.optional_jid("jid").unwrap_or_default();
                let lid = parser.optional_jid("lid").filter(|lid| !lid.is_empty());
                if let Err(e) = parser.finish() {
                    warn!(target: "Client/Pair", "Error parsing device node attributes: {e:?}");
                }
                (jid, lid)
            }
            None => (Jid::default(), None),
        };

        Self {
            request_id,
            jid,
            lid,
            business_name,
            platform,
        }
    }

    /// Address the account signature key is stored under. Falls back to the
    /// phone number JID when the server sent no LID.
    pub fn identity_address(&self) -> String {
        self.lid
            .as_ref()
            .unwrap_or(&self.jid)
            .with_device(0)
            .to_protocol_address_string()
    }
}

/// Handles the server-driven half of device linking: QR refs and the final
/// `pair-success`.
pub struct PairingCoordinator {
    session: Mutex<Option<PairingSession>>,
    pre_pair: Arc<dyn PrePairHook>,
}

impl PairingCoordinator {
    pub fn new(pre_pair: Arc<dyn PrePairHook>) -> Self {
        Self {
            session: Mutex::new(None),
            pre_pair,
        }
    }

    /// Snapshot of the pairing in flight, if any.
    pub async fn session(&self) -> Option<PairingSession> {
        self.session.lock().await.clone()
    }

    pub(crate) async fn clear_session(&self) {
        self.session.lock().await.take();
    }

    /// Returns false for iqs that are not pairing requests.
    pub(crate) async fn handle_iq(&self, client: &Arc<Client>, node: &Node) -> bool {
        if node.attrs.get("from").map(String::as_str) != Some(SERVER_JID) {
            return false;
        }
        let [child] = node.children().unwrap_or_default() else {
            return false;
        };

        match child.tag.as_str() {
            "pair-device" => {
                self.handle_pair_device(client, node, child).await;
                true
            }
            "pair-success" => {
                let Some(req_id) = node.attrs.get("id").cloned() else {
                    error!(target: "Client/Pair", "Received pair-success without request ID");
                    return true;
                };
                let session = PairingSession::from_node(req_id, child);
                let identity_bytes = match child
                    .get_optional_child("device-identity")
                    .and_then(|n| n.content.as_ref())
                {
                    Some(NodeContent::Bytes(bytes)) => bytes.clone(),
                    _ => Vec::new(),
                };

                if let Some(previous) = self.session.lock().await.replace(session.clone()) {
                    warn!(target: "Client/Pair", "Replacing in-flight pairing for request {}", previous.request_id);
                }
                let client = client.clone();
                tokio::spawn(async move {
                    client.finish_pairing(session, identity_bytes).await;
                });
                true
            }
            _ => false,
        }
    }

    async fn handle_pair_device(&self, client: &Arc<Client>, request: &Node, pair_device: &Node) {
        if let Some(ack) = PairUtils::build_ack_node(request)
            && let Err(e) = client.send_node(ack).await
        {
            warn!(target: "Client/Pair", "Failed to send acknowledgement: {e}");
        }

        let device = match client.store.load_device().await {
            Ok(device) => device,
            Err(e) => {
                error!(target: "Client/Pair", "Failed to load device for QR generation: {e}");
                return;
            }
        };

        let mut codes = Vec::new();
        for child in pair_device.children().unwrap_or_default() {
            let pairing_ref = match (child.tag.as_str(), &child.content) {
                ("ref", Some(NodeContent::Bytes(bytes))) => String::from_utf8(bytes.clone()).ok(),
                ("ref", Some(NodeContent::String(s))) => Some(s.clone()),
                _ => None,
            };
            match pairing_ref {
                Some(pairing_ref) => codes.push(PairUtils::make_qr_data(&device, &pairing_ref)),
                None => {
                    warn!(target: "Client/Pair", "Skipping unexpected child <{}> in pair-device", child.tag)
                }
            }
        }

        debug!(target: "Client/Pair", "Dispatching QR event with {} codes", codes.len());
        client.dispatch_event(Event::Qr(Qr { codes }));
    }

    /// Verifies the payload and persists the pairing. Every failure after the
    /// device record was written removes it again before returning.
    async fn complete(
        &self,
        client: &Client,
        session: &PairingSession,
        identity_bytes: &[u8],
    ) -> Result<(), PairError> {
        let mut device = client
            .store
            .load_device()
            .await
            .map_err(database("load device"))?;

        let verified = PairUtils::do_pair_crypto(&device, identity_bytes)?;

        if !self
            .pre_pair
            .allow(&session.jid, &session.platform, &session.business_name)
            .await
        {
            return Err(PairError::RejectedLocally);
        }

        if session.lid.is_none() {
            warn!(target: "Client/Pair", "pair-success for {} did not include a LID", session.jid);
        }
        device.account = Some(verified.signed_identity.clone());
        device.id = Some(session.jid.clone());
        device.lid = session.lid.clone();
        device.business_name = session.business_name.clone();
        device.platform = session.platform.clone();
        client
            .store
            .save_device(&device)
            .await
            .map_err(database("save paired device"))?;

        let identity_address = session.identity_address();
        if let Err(source) = client
            .store
            .put_identity(&identity_address, verified.account_signature_key)
            .await
        {
            rollback_device(client).await;
            return Err(PairError::Database {
                context: "store account identity",
                source,
            });
        }

        client.expected_disconnect.set();

        let response = PairUtils::build_pair_success_response(
            &session.request_id,
            verified.self_signed_identity_bytes(),
            verified.key_index(),
        );
        if let Err(e) = client.send_node(response).await {
            if let Err(e) = client.store.delete_identity(&identity_address).await {
                error!(target: "Client/Pair", "Failed to roll back account identity: {e}");
            }
            rollback_device(client).await;
            return Err(PairError::Send(e));
        }

        if let Some(lid) = &session.lid
            && let Err(e) = client.store.put_lid_pn_mapping(lid, &session.jid).await
        {
            warn!(target: "Client/Pair", "Failed to store LID mapping for {lid}: {e}");
        }
        Ok(())
    }
}

async fn rollback_device(client: &Client) {
    if let Err(e) = client.store.delete_device().await {
        error!(target: "Client/Pair", "Failed to roll back paired device: {e}");
    }
}

impl Client {
    async fn finish_pairing(self: Arc<Self>, session: PairingSession, identity_bytes: Vec<u8>) {
        let result = self
            .pairing
            .complete(&self, &session, &identity_bytes)
            .await;
        self.pairing.clear_session().await;

        match result {
            Ok(()) => {
                info!(target: "Client/Pair", "Successfully paired {}", session.jid);
                self.dispatch_event(Event::PairSuccess(PairSuccess {
                    id: session.jid,
                    lid: session.lid.unwrap_or_default(),
                    business_name: session.business_name,
                    platform: session.platform,
                }));
                self.send_unified_session().await;
            }
            Err(e) => {
                error!(target: "Client/Pair", "Failed to handle pair success: {e}");
                if let Some((code, text)) = e.server_error() {
                    let error_node =
                        PairUtils::build_pair_error_node(&session.request_id, code, text);
                    if let Err(send_err) = self.send_node(error_node).await {
                        error!(target: "Client/Pair", "Failed to send pair error node: {send_err}");
                    }
                }
                self.disconnect().await;
                self.dispatch_event(Event::PairError(events::PairError {
                    id: session.jid,
                    lid: session.lid.unwrap_or_default(),
                    business_name: session.business_name,
                    platform: session.platform,
                    error: e.to_string(),
                }));
            }
        }
    }
}
