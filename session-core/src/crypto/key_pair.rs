use super::xeddsa::{PUBLIC_KEY_LENGTH, PrivateKey, SIGNATURE_LENGTH};

/// A Curve25519 key pair usable for both agreement and XEdDSA signing.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate(&mut rand::rng()))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        Self {
            public_key: private_key.public_key_bytes(),
            private_key,
        }
    }

    pub fn sign(&self, message: &[&[u8]]) -> [u8; SIGNATURE_LENGTH] {
        self.private_key
            .calculate_signature(&mut rand::rng(), message)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}
