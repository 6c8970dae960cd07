//! Symmetric handshake state: cipher state, chaining key, transcript hash.

use zeroize::Zeroizing;

use crate::cipher_state::{CipherState, SymmetricKey};
use crate::primitives::{CipherFunctions, HashFunctions};
use crate::NoiseError;

pub struct SymmetricState<C: CipherFunctions, H: HashFunctions> {
    cipher_state: CipherState<C>,
    chaining_key: SymmetricKey,
    handshake_digest: [u8; 32],
    hash: H,
}

impl<C: CipherFunctions, H: HashFunctions> SymmetricState<C, H> {
    /// Seed the state from the full protocol name, e.g.
    /// `Noise_XK_secp256k1_ChaChaPoly_SHA256`. Names up to the hash length
    /// are zero-padded; longer names are hashed.
    #[must_use]
    pub fn new(protocol_name: &[u8], cipher: C, hash: H) -> Self {
        let handshake_digest = if protocol_name.len() <= H::HASH_LEN {
            let mut padded = [0u8; 32];
            padded[..protocol_name.len()].copy_from_slice(protocol_name);
            padded
        } else {
            hash.hash(protocol_name)
        };
        Self {
            cipher_state: CipherState::new(cipher),
            chaining_key: SymmetricKey(handshake_digest),
            handshake_digest,
            hash,
        }
    }

    /// Absorb `data` into the transcript: `h = H(h || data)`.
    #[must_use]
    pub fn mix_hash(mut self, data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(H::HASH_LEN + data.len());
        buf.extend_from_slice(&self.handshake_digest);
        buf.extend_from_slice(data);
        self.handshake_digest = self.hash.hash(&buf);
        self
    }

    /// Mix `ikm` into the chaining key and install the derived cipher key at
    /// nonce zero. The transcript hash is untouched.
    #[must_use]
    pub fn mix_key(mut self, ikm: &[u8]) -> Self {
        let (chaining_key, temp_key) = self.hash.hkdf(self.chaining_key.as_bytes(), ikm);
        self.chaining_key = SymmetricKey(*chaining_key);
        self.cipher_state = self.cipher_state.rekey(SymmetricKey(*temp_key));
        self
    }

    /// Encrypt `plaintext` using the transcript hash as AD, then absorb the
    /// ciphertext. Before the first `mix_key` the "ciphertext" is the
    /// plaintext itself, but it is absorbed all the same.
    ///
    /// # Errors
    /// Propagates failures from the cipher state.
    pub fn encrypt_and_hash(self, plaintext: &[u8]) -> Result<(Self, Vec<u8>), NoiseError> {
        let Self {
            cipher_state,
            chaining_key,
            handshake_digest,
            hash,
        } = self;
        let (cipher_state, ciphertext) = cipher_state.encrypt_with_ad(&handshake_digest, plaintext)?;
        let next = Self {
            cipher_state,
            chaining_key,
            handshake_digest,
            hash,
        }
        .mix_hash(&ciphertext);
        Ok((next, ciphertext))
    }

    /// Decrypt `ciphertext` using the transcript hash as AD, then absorb the
    /// ciphertext. Absorbing the ciphertext, not the plaintext, is what
    /// keeps both transcripts identical.
    ///
    /// # Errors
    /// Returns `NoiseError::Authentication` when the tag does not verify.
    pub fn decrypt_and_hash(self, ciphertext: &[u8]) -> Result<(Self, Vec<u8>), NoiseError> {
        let Self {
            cipher_state,
            chaining_key,
            handshake_digest,
            hash,
        } = self;
        let (cipher_state, plaintext) = cipher_state.decrypt_with_ad(&handshake_digest, ciphertext)?;
        let next = Self {
            cipher_state,
            chaining_key,
            handshake_digest,
            hash,
        }
        .mix_hash(ciphertext);
        Ok((next, plaintext))
    }

    /// Terminal step: derive the two transport cipher states. The first
    /// belongs to the initiator-to-responder direction. Also returns the
    /// final chaining key, which BOLT #8 reuses as the key-rotation salt.
    #[must_use]
    pub fn split(&self) -> (CipherState<C>, CipherState<C>, Zeroizing<[u8; 32]>)
    where
        C: Clone,
    {
        let (first, second) = self.hash.hkdf(self.chaining_key.as_bytes(), &[]);
        let sending = CipherState::new(self.cipher_state.cipher().clone()).rekey(SymmetricKey(*first));
        let receiving =
            CipherState::new(self.cipher_state.cipher().clone()).rekey(SymmetricKey(*second));
        (
            sending,
            receiving,
            Zeroizing::new(*self.chaining_key.as_bytes()),
        )
    }

    #[must_use]
    pub fn has_key(&self) -> bool {
        self.cipher_state.has_key()
    }

    /// Current transcript hash, the AD of the next AEAD operation.
    #[must_use]
    pub fn handshake_digest(&self) -> &[u8; 32] {
        &self.handshake_digest
    }
}
