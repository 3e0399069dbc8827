use crate::crypto::key_pair::KeyPair;
use rand::RngCore;
use wasession_binary::jid::Jid;
use wasession_proto::adv::AdvSignedDeviceIdentity;

/// libsignal's type byte for serialised Curve25519 public keys.
const DJB_TYPE: u8 = 0x05;

#[derive(Clone, Debug)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    pub signature: [u8; 64],
}

/// Long-lived identity of this client device.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: Option<Jid>,
    pub lid: Option<Jid>,
    pub business_name: String,
    pub platform: String,
    pub registration_id: u32,
    pub noise_key: KeyPair,
    pub identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    pub adv_secret_key: [u8; 32],
    pub account: Option<AdvSignedDeviceIdentity>,
}

impl Device {
    /// Fresh unpaired device with newly generated key material.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let identity_key = KeyPair::generate();
        let pre_key = KeyPair::generate();
        let signature = identity_key.sign(&[&[DJB_TYPE], &pre_key.public_key]);

        let mut adv_secret_key = [0u8; 32];
        rng.fill_bytes(&mut adv_secret_key);

        Self {
            id: None,
            lid: None,
            business_name: String::new(),
            platform: String::new(),
            registration_id: (rng.next_u32() % 16380) + 1,
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key: SignedPreKey {
                key_id: 1,
                key_pair: pre_key,
                signature,
            },
            adv_secret_key,
            account: None,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.id.is_some()
    }

    /// Drops everything pairing assigned, keeping the key material.
    pub fn clear_pairing(&mut self) {
        self.id = None;
        self.lid = None;
        self.business_name.clear();
        self.platform.clear();
        self.account = None;
    }
}
