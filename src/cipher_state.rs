//! AEAD cipher state: a key, a monotonic nonce, and nothing else.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::CipherFunctions;
use crate::NoiseError;

/// A 32-byte symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub(crate) [u8; 32]);

impl SymmetricKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SymmetricKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Cipher state of a single direction.
///
/// Before any key has been mixed in, the state is `Unkeyed` and both
/// operations pass data through untouched; once keyed, each operation
/// consumes the state and returns its successor with the nonce advanced, so
/// a `(key, nonce)` pair can never be used twice.
pub enum CipherState<C: CipherFunctions> {
    Unkeyed {
        cipher: C,
    },
    Keyed {
        cipher: C,
        key: SymmetricKey,
        nonce: u64,
    },
}

impl<C: CipherFunctions> CipherState<C> {
    #[must_use]
    pub fn new(cipher: C) -> Self {
        Self::Unkeyed { cipher }
    }

    /// Promote with `key`: empty stays unkeyed, 32 bytes starts a keyed
    /// state at nonce zero.
    ///
    /// # Errors
    /// Any other key length is a `NoiseError::Config`.
    pub fn initialize_key(self, key: &[u8]) -> Result<Self, NoiseError> {
        match key.len() {
            0 => Ok(Self::Unkeyed {
                cipher: self.into_cipher(),
            }),
            32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(key);
                Ok(self.rekey(SymmetricKey(bytes)))
            }
            n => Err(NoiseError::Config(format!(
                "cipher key must be empty or 32 bytes, got {n}"
            ))),
        }
    }

    pub(crate) fn rekey(self, key: SymmetricKey) -> Self {
        Self::Keyed {
            cipher: self.into_cipher(),
            key,
            nonce: 0,
        }
    }

    fn into_cipher(self) -> C {
        match self {
            Self::Unkeyed { cipher } | Self::Keyed { cipher, .. } => cipher,
        }
    }

    pub(crate) fn cipher(&self) -> &C {
        match self {
            Self::Unkeyed { cipher } | Self::Keyed { cipher, .. } => cipher,
        }
    }

    #[must_use]
    pub fn has_key(&self) -> bool {
        matches!(self, Self::Keyed { .. })
    }

    /// The current key, if one has been installed.
    #[must_use]
    pub fn key(&self) -> Option<&SymmetricKey> {
        match self {
            Self::Unkeyed { .. } => None,
            Self::Keyed { key, .. } => Some(key),
        }
    }

    /// Nonce the next operation will use. `None` while unkeyed.
    #[must_use]
    pub fn nonce(&self) -> Option<u64> {
        match self {
            Self::Unkeyed { .. } => None,
            Self::Keyed { nonce, .. } => Some(*nonce),
        }
    }

    /// Encrypt `plaintext` with `associated_data`, returning the successor
    /// state and the ciphertext. Unkeyed states return the plaintext as is.
    ///
    /// # Errors
    /// Propagates `NoiseError::Crypto` from the AEAD.
    pub fn encrypt_with_ad(
        self,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<(Self, Vec<u8>), NoiseError> {
        match self {
            Self::Unkeyed { .. } => Ok((self, plaintext.to_vec())),
            Self::Keyed { cipher, key, nonce } => {
                let ciphertext = cipher.encrypt(&key.0, nonce, associated_data, plaintext)?;
                Ok((
                    Self::Keyed {
                        cipher,
                        key,
                        nonce: nonce + 1,
                    },
                    ciphertext,
                ))
            }
        }
    }

    /// Decrypt `ciphertext` with `associated_data`, returning the successor
    /// state and the plaintext. Unkeyed states return the ciphertext as is.
    ///
    /// # Errors
    /// Returns `NoiseError::Authentication` when the tag does not verify;
    /// the state is consumed either way.
    pub fn decrypt_with_ad(
        self,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<(Self, Vec<u8>), NoiseError> {
        match self {
            Self::Unkeyed { .. } => Ok((self, ciphertext.to_vec())),
            Self::Keyed { cipher, key, nonce } => {
                let plaintext = cipher.decrypt(&key.0, nonce, associated_data, ciphertext)?;
                Ok((
                    Self::Keyed {
                        cipher,
                        key,
                        nonce: nonce + 1,
                    },
                    plaintext,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::ChaChaPoly;

    fn keyed(key: [u8; 32]) -> CipherState<ChaChaPoly> {
        CipherState::new(ChaChaPoly).initialize_key(&key).unwrap()
    }

    #[test]
    fn unkeyed_state_passes_data_through() {
        let state = CipherState::new(ChaChaPoly);
        let (state, out) = state.encrypt_with_ad(b"ad", b"plain").unwrap();
        assert_eq!(out, b"plain");
        assert!(!state.has_key());
        let (state, out) = state.decrypt_with_ad(b"ad", b"cipher").unwrap();
        assert_eq!(out, b"cipher");
        assert!(state.nonce().is_none());
    }

    #[test]
    fn initialize_key_rejects_bad_lengths() {
        for len in [1usize, 16, 31, 33, 64] {
            let err = CipherState::new(ChaChaPoly)
                .initialize_key(&vec![0u8; len])
                .map(|_| ())
                .unwrap_err();
            assert!(matches!(err, NoiseError::Config(_)), "len {len}");
        }
        let state = CipherState::new(ChaChaPoly).initialize_key(&[]).unwrap();
        assert!(!state.has_key());
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (send, ciphertext) = keyed([9u8; 32]).encrypt_with_ad(b"ad", b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + 16);
        assert_eq!(send.nonce(), Some(1));

        let (_, plaintext) = keyed([9u8; 32]).decrypt_with_ad(b"ad", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn mismatched_ad_fails_authentication() {
        let (_, ciphertext) = keyed([9u8; 32]).encrypt_with_ad(b"ad", b"hello").unwrap();
        let err = keyed([9u8; 32])
            .decrypt_with_ad(b"other", &ciphertext)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, NoiseError::Authentication));
    }

    #[test]
    fn nonce_advances_and_ciphertexts_differ() {
        let mut state = keyed([1u8; 32]);
        let mut seen = Vec::new();
        for i in 0..5u64 {
            assert_eq!(state.nonce(), Some(i));
            let (next, ciphertext) = state.encrypt_with_ad(&[], b"same plaintext").unwrap();
            assert!(!seen.contains(&ciphertext));
            seen.push(ciphertext);
            state = next;
        }
        assert_eq!(state.nonce(), Some(5));
    }
}
