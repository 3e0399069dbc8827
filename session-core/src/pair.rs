use crate::crypto::key_pair::KeyPair;
use crate::crypto::xeddsa::{self, SIGNATURE_LENGTH};
use crate::crypto::{HmacSha256, hmac_sha256};
use crate::store::Device;
use base64::Engine as _;
use base64::prelude::*;
use hmac::Mac;
use prost::Message;
use thiserror::Error;
use wasession_binary::builder::NodeBuilder;
use wasession_binary::jid::SERVER_JID;
use wasession_binary::node::Node;
use wasession_proto::adv::{
    AdvDeviceIdentity, AdvEncryptionType, AdvSignedDeviceIdentity, AdvSignedDeviceIdentityHmac,
};

pub const ADV_PREFIX_ACCOUNT_SIGNATURE: &[u8] = &[6, 0];
pub const ADV_PREFIX_DEVICE_SIGNATURE: &[u8] = &[6, 1];
pub const ADV_HOSTED_PREFIX_ACCOUNT_SIGNATURE: &[u8] = &[6, 5];
pub const ADV_HOSTED_PREFIX_DEVICE_SIGNATURE: &[u8] = &[6, 6];

#[derive(Debug, Error)]
pub enum PairCryptoError {
    #[error("failed to parse {what} in pair success message: {source}")]
    Proto {
        what: &'static str,
        #[source]
        source: prost::DecodeError,
    },
    #[error("invalid device identity HMAC in pair success message")]
    InvalidDeviceIdentityHmac,
    #[error("invalid device signature in pair success message")]
    InvalidDeviceSignature,
}

impl PairCryptoError {
    /// Code and reason reported back to the server in the pairing error iq.
    pub fn server_error(&self) -> (u16, &'static str) {
        match self {
            Self::Proto { .. } => (500, "internal-error"),
            Self::InvalidDeviceIdentityHmac => (401, "hmac-mismatch"),
            Self::InvalidDeviceSignature => (401, "signature-mismatch"),
        }
    }
}

/// A pair-success payload that passed the HMAC and account signature checks
/// and now carries our device signature.
#[derive(Debug, Clone)]
pub struct VerifiedPairing {
    pub signed_identity: AdvSignedDeviceIdentity,
    pub details: AdvDeviceIdentity,
    pub account_signature_key: [u8; 32],
}

impl VerifiedPairing {
    pub fn key_index(&self) -> u32 {
        self.details.key_index.unwrap_or_default()
    }

    /// The identity as sent back to the server: account signature key stripped.
    pub fn self_signed_identity_bytes(&self) -> Vec<u8> {
        let mut identity = self.signed_identity.clone();
        identity.account_signature_key = None;
        identity.encode_to_vec()
    }
}

pub struct PairUtils;

impl PairUtils {
    /// Constructs the full QR code string from the ref and device keys.
    pub fn make_qr_data(device: &Device, ref_str: &str) -> String {
        let noise_b64 = BASE64_STANDARD.encode(device.noise_key.public_key);
        let identity_b64 = BASE64_STANDARD.encode(device.identity_key.public_key);
        let adv_b64 = BASE64_STANDARD.encode(device.adv_secret_key);

        [ref_str.to_string(), noise_b64, identity_b64, adv_b64].join(",")
    }

    /// Empty result iq acknowledging a server request.
    pub fn build_ack_node(request_node: &Node) -> Option<Node> {
        let to = request_node.attrs.get("from")?;
        let id = request_node.attrs.get("id")?;
        Some(
            NodeBuilder::new("iq")
                .attrs([
                    ("to", to.as_str()),
                    ("id", id.as_str()),
                    ("type", "result"),
                ])
                .build(),
        )
    }

    pub fn build_pair_error_node(req_id: &str, code: u16, text: &str) -> Node {
        let error_node = NodeBuilder::new("error")
            .attrs([("code", code.to_string()), ("text", text.to_string())])
            .build();
        NodeBuilder::new("iq")
            .attrs([
                ("to", SERVER_JID.to_string()),
                ("type", "error".to_string()),
                ("id", req_id.to_string()),
            ])
            .children([error_node])
            .build()
    }

    pub fn build_pair_success_response(
        req_id: &str,
        self_signed_identity_bytes: Vec<u8>,
        key_index: u32,
    ) -> Node {
        let response_content = NodeBuilder::new("pair-device-sign")
            .children([NodeBuilder::new("device-identity")
                .attr("key-index", key_index.to_string())
                .bytes(self_signed_identity_bytes)
                .build()])
            .build();
        NodeBuilder::new("iq")
            .attrs([
                ("to", SERVER_JID.to_string()),
                ("id", req_id.to_string()),
                ("type", "result".to_string()),
            ])
            .children([response_content])
            .build()
    }

    /// Runs the verification chain over a pair-success `device-identity` payload.
    ///
    /// Checks happen in a fixed order: container parse, HMAC, inner parse,
    /// account signature. The first failure is returned.
    pub fn do_pair_crypto(
        device: &Device,
        device_identity_bytes: &[u8],
    ) -> Result<VerifiedPairing, PairCryptoError> {
        let container = AdvSignedDeviceIdentityHmac::decode(device_identity_bytes).map_err(
            |source| PairCryptoError::Proto {
                what: "device identity container",
                source,
            },
        )?;

        Self::verify_container_hmac(&device.adv_secret_key, &container)?;

        let details_bytes = container.details.as_deref().unwrap_or_default();
        let mut signed_identity =
            AdvSignedDeviceIdentity::decode(details_bytes).map_err(|source| {
                PairCryptoError::Proto {
                    what: "signed device identity",
                    source,
                }
            })?;
        let details =
            AdvDeviceIdentity::decode(signed_identity.details.as_deref().unwrap_or_default())
                .map_err(|source| PairCryptoError::Proto {
                    what: "device identity details",
                    source,
                })?;

        let is_hosted = details.device_type == Some(AdvEncryptionType::Hosted as i32);
        if !Self::verify_account_signature(
            &signed_identity,
            &device.identity_key.public_key,
            is_hosted,
        ) {
            return Err(PairCryptoError::InvalidDeviceSignature);
        }

        let device_signature = Self::generate_device_signature(&signed_identity, &device.identity_key);
        signed_identity.device_signature = Some(device_signature.to_vec());

        let account_signature_key = signed_identity
            .account_signature_key
            .as_deref()
            .and_then(|k| <[u8; 32]>::try_from(k).ok())
            .ok_or(PairCryptoError::InvalidDeviceSignature)?;

        Ok(VerifiedPairing {
            signed_identity,
            details,
            account_signature_key,
        })
    }

    /// HMAC-SHA256 over `details` keyed with the advertisement secret. Hosted
    /// accounts prepend the hosted account prefix. Comparison is constant time.
    pub fn verify_container_hmac(
        adv_secret_key: &[u8; 32],
        container: &AdvSignedDeviceIdentityHmac,
    ) -> Result<(), PairCryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(adv_secret_key)
            .map_err(|_| PairCryptoError::InvalidDeviceIdentityHmac)?;
        if container.account_type == Some(AdvEncryptionType::Hosted as i32) {
            mac.update(ADV_HOSTED_PREFIX_ACCOUNT_SIGNATURE);
        }
        mac.update(container.details.as_deref().unwrap_or_default());
        mac.verify_slice(container.hmac.as_deref().unwrap_or_default())
            .map_err(|_| PairCryptoError::InvalidDeviceIdentityHmac)
    }

    pub fn verify_account_signature(
        identity: &AdvSignedDeviceIdentity,
        identity_public_key: &[u8; 32],
        is_hosted: bool,
    ) -> bool {
        let (Some(key), Some(signature)) = (
            identity
                .account_signature_key
                .as_deref()
                .and_then(|k| <&[u8; 32]>::try_from(k).ok()),
            identity
                .account_signature
                .as_deref()
                .and_then(|s| <&[u8; SIGNATURE_LENGTH]>::try_from(s).ok()),
        ) else {
            return false;
        };

        let prefix = if is_hosted {
            ADV_HOSTED_PREFIX_ACCOUNT_SIGNATURE
        } else {
            ADV_PREFIX_ACCOUNT_SIGNATURE
        };
        let details = identity.details.as_deref().unwrap_or_default();

        xeddsa::verify_signature(key, &[prefix, details, identity_public_key], signature)
    }

    pub fn generate_device_signature(
        identity: &AdvSignedDeviceIdentity,
        identity_key: &KeyPair,
    ) -> [u8; SIGNATURE_LENGTH] {
        identity_key.sign(&[
            ADV_PREFIX_DEVICE_SIGNATURE,
            identity.details.as_deref().unwrap_or_default(),
            &identity_key.public_key,
            identity.account_signature_key.as_deref().unwrap_or_default(),
        ])
    }

    /// Checks a companion's device signature from the primary device's side.
    pub fn verify_device_signature(
        identity: &AdvSignedDeviceIdentity,
        companion_identity_key: &[u8; 32],
        account_signature_key: &[u8; 32],
        is_hosted: bool,
    ) -> bool {
        let Some(signature) = identity
            .device_signature
            .as_deref()
            .and_then(|s| <&[u8; SIGNATURE_LENGTH]>::try_from(s).ok())
        else {
            return false;
        };
        let prefix = if is_hosted {
            ADV_HOSTED_PREFIX_DEVICE_SIGNATURE
        } else {
            ADV_PREFIX_DEVICE_SIGNATURE
        };
        xeddsa::verify_signature(
            companion_identity_key,
            &[
                prefix,
                identity.details.as_deref().unwrap_or_default(),
                companion_identity_key,
                account_signature_key,
            ],
            signature,
        )
    }

    /// Parses a QR string into (ref, noise public key, identity public key, adv secret).
    pub fn parse_qr_code(
        qr_code: &str,
    ) -> Result<(String, [u8; 32], [u8; 32], [u8; 32]), anyhow::Error> {
        let parts: Vec<&str> = qr_code.split(',').collect();
        let [pairing_ref, noise, identity, adv] = parts.as_slice() else {
            return Err(anyhow::anyhow!("Invalid QR code format"));
        };
        let decode32 = |part: &str, what: &str| -> Result<[u8; 32], anyhow::Error> {
            BASE64_STANDARD
                .decode(part)
                .map_err(|e| anyhow::anyhow!(e))?
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid {what} length"))
        };
        Ok((
            pairing_ref.to_string(),
            decode32(noise, "noise public key")?,
            decode32(identity, "identity public key")?,
            decode32(adv, "adv secret")?,
        ))
    }
}

/// The primary (phone) side of pairing: signs a companion's identity and
/// wraps it in the HMAC container the server forwards in `pair-success`.
pub struct PrimaryDevice {
    pub account_key: KeyPair,
    pub key_index: u32,
    pub hosted: bool,
}

impl PrimaryDevice {
    pub fn new(key_index: u32) -> Self {
        Self {
            account_key: KeyPair::generate(),
            key_index,
            hosted: false,
        }
    }

    pub fn hosted(mut self) -> Self {
        self.hosted = true;
        self
    }

    /// Identity details plus account signature over `companion_identity_key`.
    pub fn sign_companion(&self, companion_identity_key: &[u8; 32]) -> AdvSignedDeviceIdentity {
        let encryption_type = if self.hosted {
            AdvEncryptionType::Hosted
        } else {
            AdvEncryptionType::E2ee
        };
        let details = AdvDeviceIdentity {
            raw_id: Some(1),
            timestamp: Some(chrono::Utc::now().timestamp() as u64),
            key_index: Some(self.key_index),
            account_type: Some(encryption_type as i32),
            device_type: Some(encryption_type as i32),
        }
        .encode_to_vec();

        let prefix = if self.hosted {
            ADV_HOSTED_PREFIX_ACCOUNT_SIGNATURE
        } else {
            ADV_PREFIX_ACCOUNT_SIGNATURE
        };
        let account_signature = self
            .account_key
            .sign(&[prefix, &details, companion_identity_key]);

        AdvSignedDeviceIdentity {
            details: Some(details),
            account_signature_key: Some(self.account_key.public_key.to_vec()),
            account_signature: Some(account_signature.to_vec()),
            device_signature: None,
        }
    }

    /// Wraps a signed identity in the HMAC container keyed with the companion's adv secret.
    pub fn seal(
        &self,
        identity: &AdvSignedDeviceIdentity,
        adv_secret_key: &[u8; 32],
    ) -> AdvSignedDeviceIdentityHmac {
        let details = identity.encode_to_vec();
        let (account_type, hmac) = if self.hosted {
            (
                AdvEncryptionType::Hosted,
                hmac_sha256(adv_secret_key, &[ADV_HOSTED_PREFIX_ACCOUNT_SIGNATURE, &details]),
            )
        } else {
            (AdvEncryptionType::E2ee, hmac_sha256(adv_secret_key, &[&details]))
        };
        AdvSignedDeviceIdentityHmac {
            details: Some(details),
            hmac: Some(hmac.to_vec()),
            account_type: Some(account_type as i32),
        }
    }

    /// Full `device-identity` payload for a companion that showed `qr_code`.
    pub fn pairing_payload(&self, qr_code: &str) -> Result<Vec<u8>, anyhow::Error> {
        let (_, _, identity, adv_secret) = PairUtils::parse_qr_code(qr_code)?;
        let signed = self.sign_companion(&identity);
        Ok(self.seal(&signed, &adv_secret).encode_to_vec())
    }
}
