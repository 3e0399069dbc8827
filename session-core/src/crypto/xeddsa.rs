//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! XEdDSA signatures over Curve25519 keys.
//!
//! See <https://signal.org/docs/specifications/xeddsa/>. The Edwards sign bit is
//! carried in the top bit of the last signature byte, which libsignal clients expect.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{self, Scalar};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// 0xFE followed by 31 bytes of 0xFF.
static XEDDSA_HASH_PREFIX: [u8; 32] = [
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
    scalar: Scalar,
    ed_public_key: CompressedEdwardsY,
    sign_bit: u8,
}

impl PrivateKey {
    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        csprng.fill_bytes(&mut bytes);
        Self::from(bytes)
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        *PublicKey::from(&self.secret).as_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// Signs the concatenation of `message` pieces.
    pub fn calculate_signature<R>(
        &self,
        csprng: &mut R,
        message: &[&[u8]],
    ) -> [u8; SIGNATURE_LENGTH]
    where
        R: CryptoRng + RngCore,
    {
        let mut random_bytes = [0u8; 64];
        csprng.fill_bytes(&mut random_bytes);

        let key_data = self.secret.to_bytes();

        let mut hash1 = Sha512::new();
        hash1.update(&XEDDSA_HASH_PREFIX[..]);
        hash1.update(&key_data[..]);
        for message_piece in message {
            hash1.update(message_piece);
        }
        hash1.update(&random_bytes[..]);

        let r = Scalar::from_hash(hash1);
        let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

        let mut hash = Sha512::new();
        hash.update(cap_r.as_bytes());
        hash.update(self.ed_public_key.as_bytes());
        for message_piece in message {
            hash.update(message_piece);
        }

        let h = Scalar::from_hash(hash);
        let s = (h * self.scalar) + r;

        let mut result = [0u8; SIGNATURE_LENGTH];
        result[..32].copy_from_slice(cap_r.as_bytes());
        result[32..].copy_from_slice(s.as_bytes());
        result[SIGNATURE_LENGTH - 1] &= 0b0111_1111_u8;
        result[SIGNATURE_LENGTH - 1] |= self.sign_bit;
        result
    }
}

impl From<[u8; PRIVATE_KEY_LENGTH]> for PrivateKey {
    fn from(private_key: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(scalar::clamp_integer(private_key));
        let scalar = Scalar::from_bytes_mod_order(secret.to_bytes());
        let ed_public_key = (&scalar * ED25519_BASEPOINT_TABLE).compress();
        let sign_bit = ed_public_key.as_bytes()[31] & 0b1000_0000_u8;
        PrivateKey {
            secret,
            scalar,
            ed_public_key,
            sign_bit,
        }
    }
}

/// Verifies an XEdDSA signature made over the concatenation of `message` pieces.
pub fn verify_signature(
    their_public_key: &[u8; PUBLIC_KEY_LENGTH],
    message: &[&[u8]],
    signature: &[u8; SIGNATURE_LENGTH],
) -> bool {
    let mont_point = MontgomeryPoint(*their_public_key);
    let ed_pub_key_point =
        match mont_point.to_edwards((signature[SIGNATURE_LENGTH - 1] & 0b1000_0000_u8) >> 7) {
            Some(x) => x,
            None => return false,
        };
    let cap_a = ed_pub_key_point.compress();
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature[32..]);
    s[31] &= 0b0111_1111_u8;
    if (s[31] & 0b1110_0000_u8) != 0 {
        return false;
    }
    let minus_cap_a = -ed_pub_key_point;

    let mut hash = Sha512::new();
    hash.update(&cap_r[..]);
    hash.update(cap_a.as_bytes());
    for message_piece in message {
        hash.update(message_piece);
    }
    let h = Scalar::from_hash(hash);

    let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &minus_cap_a,
        &Scalar::from_bytes_mod_order(s),
    )
    .compress();

    bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let mut rng = rand::rng();
        let key = PrivateKey::generate(&mut rng);
        let public = key.public_key_bytes();
        let sig = key.calculate_signature(&mut rng, &[b"hello ", b"world"]);

        assert!(verify_signature(&public, &[b"hello world"], &sig));
        assert!(!verify_signature(&public, &[b"hello there"], &sig));

        let other = PrivateKey::generate(&mut rng).public_key_bytes();
        assert!(!verify_signature(&other, &[b"hello world"], &sig));
    }
}
