//! Primitive function families: Diffie-Hellman, AEAD cipher, and hash.
//!
//! Each family is a narrow trait with exactly one implementation; the tuple
//! (`Secp256k1`, `ChaChaPoly`, `Sha256Hash`) is what BOLT #8 names
//! `secp256k1_ChaChaPoly_SHA256`. The traits exist so the state machine
//! layers are written against capabilities rather than concrete crates.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::NoiseError;

/// A secp256k1 key pair. The public key is always the one derived from the
/// secret key; the pair cannot be constructed any other way.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_scalar(&secret.to_nonzero_scalar());
        Self { secret, public }
    }

    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Compressed SEC1 encoding, the wire form of every key in the protocol.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 33] {
        compress(&self.public)
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

/// Compressed SEC1 encoding of a public key.
#[must_use]
pub fn compress(public: &PublicKey) -> [u8; 33] {
    let encoded = public.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

pub trait DhFunctions {
    const NAME: &'static str;
    /// Length of a shared secret and of a raw secret key.
    const DH_LEN: usize;
    /// Length of a public key on the wire.
    const PUB_KEY_LEN: usize;

    /// Derive a key pair from raw secret bytes.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` when the bytes are not a valid scalar.
    fn generate_key_pair(&self, secret: &[u8]) -> Result<KeyPair, NoiseError>;

    /// Diffie-Hellman between a local key pair and a remote public key.
    fn dh(&self, local: &KeyPair, remote: &PublicKey) -> Zeroizing<[u8; 32]>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Secp256k1;

impl DhFunctions for Secp256k1 {
    const NAME: &'static str = "secp256k1";
    const DH_LEN: usize = 32;
    const PUB_KEY_LEN: usize = 33;

    fn generate_key_pair(&self, secret: &[u8]) -> Result<KeyPair, NoiseError> {
        let secret = SecretKey::from_slice(secret).map_err(|e| NoiseError::Crypto(e.to_string()))?;
        Ok(KeyPair::from_secret(secret))
    }

    /// sha256 of the compressed shared point, matching `secp256k1_ecdh`.
    /// Raw x-coordinate ECDH would not interoperate.
    ///
    /// # Panics
    /// Panics if the multiplication lands on the point at infinity, which no
    /// valid public key and nonzero scalar can produce.
    fn dh(&self, local: &KeyPair, remote: &PublicKey) -> Zeroizing<[u8; 32]> {
        let scalar = local.secret().to_nonzero_scalar();
        let shared_point = k256::ProjectivePoint::from(*remote) * *scalar.as_ref();
        let shared_pk = PublicKey::from_affine(shared_point.to_affine());
        assert!(shared_pk.is_ok(), "ECDH produced invalid point");
        let shared_pk = shared_pk.unwrap();
        let digest = Sha256::digest(shared_pk.to_encoded_point(true).as_bytes());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&digest);
        out
    }
}

pub trait CipherFunctions {
    const NAME: &'static str;
    const TAG_LEN: usize;

    /// AEAD-encrypt `plaintext`, returning ciphertext with the tag appended.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` when the underlying AEAD fails.
    fn encrypt(
        &self,
        key: &[u8; 32],
        nonce: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, NoiseError>;

    /// AEAD-decrypt `ciphertext` (tag included).
    ///
    /// # Errors
    /// Returns `NoiseError::Authentication` when the tag does not verify.
    fn decrypt(
        &self,
        key: &[u8; 32],
        nonce: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, NoiseError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChaChaPoly;

impl ChaChaPoly {
    /// 12-byte nonce: 4 zero bytes then the counter, little-endian.
    fn nonce_bytes(nonce: u64) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[4..].copy_from_slice(&nonce.to_le_bytes());
        out
    }
}

impl CipherFunctions for ChaChaPoly {
    const NAME: &'static str = "ChaChaPoly";
    const TAG_LEN: usize = 16;

    fn encrypt(
        &self,
        key: &[u8; 32],
        nonce: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let cipher = ChaCha20Poly1305::new(&Key::from(*key));
        let nonce = Nonce::from(Self::nonce_bytes(nonce));
        let payload = Payload {
            msg: plaintext,
            aad: associated_data,
        };
        cipher
            .encrypt(&nonce, payload)
            .map_err(|e| NoiseError::Crypto(e.to_string()))
    }

    fn decrypt(
        &self,
        key: &[u8; 32],
        nonce: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let cipher = ChaCha20Poly1305::new(&Key::from(*key));
        let nonce = Nonce::from(Self::nonce_bytes(nonce));
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data,
        };
        cipher
            .decrypt(&nonce, payload)
            .map_err(|_| NoiseError::Authentication)
    }
}

pub trait HashFunctions {
    const NAME: &'static str;
    const HASH_LEN: usize;
    const BLOCK_LEN: usize;

    fn hash(&self, data: &[u8]) -> [u8; 32];

    fn hmac_hash(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    /// The two-output HKDF the Noise Protocol Framework defines. `ikm` must
    /// be empty or `DH_LEN` bytes.
    fn hkdf(&self, chaining_key: &[u8; 32], ikm: &[u8]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hash;

impl HashFunctions for Sha256Hash {
    const NAME: &'static str = "SHA256";
    const HASH_LEN: usize = 32;
    const BLOCK_LEN: usize = 64;

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hmac_hash(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn hkdf(&self, chaining_key: &[u8; 32], ikm: &[u8]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        debug_assert!(ikm.is_empty() || ikm.len() == Secp256k1::DH_LEN);
        let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand(&[], okm.as_mut())
            .expect("64 bytes is a valid hkdf-sha256 output length");
        let mut first = Zeroizing::new([0u8; 32]);
        let mut second = Zeroizing::new([0u8; 32]);
        first.copy_from_slice(&okm[..32]);
        second.copy_from_slice(&okm[32..]);
        (first, second)
    }
}
