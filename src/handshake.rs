//! The handshake state machine.
//!
//! Two dual roles: a [`HandshakeWriter`] produces the next message, a
//! [`HandshakeReader`] consumes it, and every step flips the role. Both are
//! move-only values; an operation consumes the state and returns its
//! successor, so a stale state cannot be replayed. When the last message of
//! the pattern is processed, the step also yields the pair of transport
//! cipher states and the final chaining key.

use k256::PublicKey;
use rand::RngCore;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::cipher_state::{CipherState, SymmetricKey};
use crate::pattern::{HandshakePattern, Token};
use crate::primitives::{CipherFunctions, DhFunctions, HashFunctions, KeyPair};
use crate::symmetric_state::SymmetricState;
use crate::NoiseError;

/// The sole seam for randomness. Production draws from the process CSPRNG;
/// tests inject fixed sequences to reproduce handshakes byte for byte.
pub trait ByteSource {
    fn next_bytes(&mut self, out: &mut [u8]);
}

/// Cryptographically secure entropy from the process RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl ByteSource for OsEntropy {
    fn next_bytes(&mut self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }
}

/// Inputs for either role of a handshake.
pub struct HandshakeConfig<D: DhFunctions, C: CipherFunctions, H: HashFunctions> {
    /// Pattern to execute (see [`crate::pattern`]).
    pub pattern: HandshakePattern,
    /// Application prologue mixed into the transcript before act one.
    pub prologue: Vec<u8>,
    /// Local static identity key, if the pattern uses one.
    pub local_static: Option<KeyPair>,
    /// Local ephemeral key; only consulted for `e` pre-messages. The `e`
    /// token on the write path always draws a fresh key from `entropy`.
    pub local_ephemeral: Option<KeyPair>,
    /// Remote static key known ahead of time (the K in XK).
    pub remote_static: Option<PublicKey>,
    /// Remote ephemeral key known ahead of time; pre-messages only.
    pub remote_ephemeral: Option<PublicKey>,
    pub dh: D,
    pub cipher: C,
    pub hash: H,
    /// Source of ephemeral secret keys.
    pub entropy: Box<dyn ByteSource + Send>,
}

/// Transport state emitted by the final handshake step, already assigned to
/// this side's directions.
pub struct TransportKeys<C: CipherFunctions> {
    pub send: CipherState<C>,
    pub recv: CipherState<C>,
    /// Final chaining key; BOLT #8 reuses it as the key-rotation salt.
    pub chaining_key: SymmetricKey,
}

struct HandshakeCore<D: DhFunctions, C: CipherFunctions, H: HashFunctions> {
    symmetric: SymmetricState<C, H>,
    dh: D,
    initiator: bool,
    local_static: Option<KeyPair>,
    local_ephemeral: Option<KeyPair>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    messages: &'static [&'static [Token]],
    entropy: Box<dyn ByteSource + Send>,
}

impl<D: DhFunctions, C: CipherFunctions, H: HashFunctions> HandshakeCore<D, C, H> {
    fn initialize(config: HandshakeConfig<D, C, H>, initiator: bool) -> Result<Self, NoiseError> {
        let pattern = config.pattern;
        pattern.validate()?;
        let protocol_name = format!(
            "Noise_{}_{}_{}_{}",
            pattern.name,
            D::NAME,
            C::NAME,
            H::NAME
        );

        let symmetric = SymmetricState::new(protocol_name.as_bytes(), config.cipher, config.hash)
            .mix_hash(&config.prologue);

        let mut core = Self {
            symmetric,
            dh: config.dh,
            initiator,
            local_static: config.local_static,
            local_ephemeral: config.local_ephemeral,
            remote_static: config.remote_static,
            remote_ephemeral: config.remote_ephemeral,
            messages: pattern.messages,
            entropy: config.entropy,
        };

        // Pre-messages seed the transcript with keys both sides already
        // know: initiator tokens first, then responder tokens. Each side
        // mixes its own public key where it is the owner and the configured
        // remote key otherwise.
        for (tokens, of_initiator) in [
            (pattern.initiator_pre_messages, true),
            (pattern.responder_pre_messages, false),
        ] {
            for &token in tokens {
                let public = core.pre_message_public(token, of_initiator == initiator)?;
                core.symmetric = core.symmetric.mix_hash(&public);
            }
        }

        Ok(core)
    }

    fn pre_message_public(&self, token: Token, local: bool) -> Result<[u8; 33], NoiseError> {
        let missing = |what: &str| NoiseError::Config(format!("{what} required by pre-message"));
        match (token, local) {
            (Token::E, true) => Ok(self
                .local_ephemeral
                .as_ref()
                .ok_or_else(|| missing("local ephemeral key"))?
                .public_bytes()),
            (Token::S, true) => Ok(self
                .local_static
                .as_ref()
                .ok_or_else(|| missing("local static key"))?
                .public_bytes()),
            (Token::E, false) => Ok(crate::primitives::compress(
                self.remote_ephemeral
                    .as_ref()
                    .ok_or_else(|| missing("remote ephemeral key"))?,
            )),
            (Token::S, false) => Ok(crate::primitives::compress(
                self.remote_static
                    .as_ref()
                    .ok_or_else(|| missing("remote static key"))?,
            )),
            _ => Err(NoiseError::Config(
                "only e and s are legal pre-message tokens".into(),
            )),
        }
    }

    /// Resolve a DH token to the one key pairing this side owns. The four
    /// pairings are mirrored between initiator and responder so both sides
    /// arrive at the same shared secret.
    fn token_secret(&self, token: Token) -> Result<Zeroizing<[u8; 32]>, NoiseError> {
        let (local, remote) = match token {
            Token::Ee => (self.local_ephemeral.as_ref(), self.remote_ephemeral.as_ref()),
            Token::Ss => (self.local_static.as_ref(), self.remote_static.as_ref()),
            Token::Es if self.initiator => {
                (self.local_ephemeral.as_ref(), self.remote_static.as_ref())
            }
            Token::Es => (self.local_static.as_ref(), self.remote_ephemeral.as_ref()),
            Token::Se if self.initiator => {
                (self.local_static.as_ref(), self.remote_ephemeral.as_ref())
            }
            Token::Se => (self.local_ephemeral.as_ref(), self.remote_static.as_ref()),
            Token::E | Token::S => unreachable!("key transmission token is not a dh token"),
        };
        let local = local.ok_or_else(|| {
            NoiseError::Config(format!("missing local key for {token:?} token"))
        })?;
        let remote = remote.ok_or_else(|| {
            NoiseError::Config(format!("missing remote key for {token:?} token"))
        })?;
        Ok(self.dh.dh(local, remote))
    }
}

impl<D: DhFunctions, C: CipherFunctions + Clone, H: HashFunctions> HandshakeCore<D, C, H> {
    fn transport_keys_if_done(&self) -> Option<TransportKeys<C>> {
        if !self.messages.is_empty() {
            return None;
        }
        let (first, second, chaining_key) = self.symmetric.split();
        // The first split output always belongs to the
        // initiator-to-responder direction.
        let (send, recv) = if self.initiator {
            (first, second)
        } else {
            (second, first)
        };
        Some(TransportKeys {
            send,
            recv,
            chaining_key: SymmetricKey(*chaining_key),
        })
    }
}

/// The side that will emit the next handshake message.
pub struct HandshakeWriter<D: DhFunctions, C: CipherFunctions, H: HashFunctions>(
    HandshakeCore<D, C, H>,
);

/// The side that will consume the next handshake message.
pub struct HandshakeReader<D: DhFunctions, C: CipherFunctions, H: HashFunctions>(
    HandshakeCore<D, C, H>,
);

fn split_front(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), NoiseError> {
    if buf.len() < n {
        return Err(NoiseError::Protocol(format!(
            "handshake message truncated: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(buf.split_at(n))
}

impl<D: DhFunctions, C: CipherFunctions + Clone, H: HashFunctions> HandshakeWriter<D, C, H> {
    /// Build the initiator side of a handshake; the initiator speaks first.
    ///
    /// # Errors
    /// Returns `NoiseError::Config` when the pattern is malformed or a key
    /// its pre-messages need is missing.
    pub fn initiator(config: HandshakeConfig<D, C, H>) -> Result<Self, NoiseError> {
        Ok(Self(HandshakeCore::initialize(config, true)?))
    }

    /// Execute the head message: process its tokens, append the encrypted
    /// payload, and flip into a reader. The third component is `Some` when
    /// this was the final message.
    ///
    /// # Errors
    /// `NoiseError::Protocol` when the message list is exhausted,
    /// `NoiseError::Config` when a token needs a key this side does not
    /// hold.
    pub fn write(
        self,
        payload: &[u8],
    ) -> Result<(HandshakeReader<D, C, H>, Vec<u8>, Option<TransportKeys<C>>), NoiseError> {
        let mut core = self.0;
        let messages: &'static [&'static [Token]] = core.messages;
        let (&message, remaining) = messages.split_first().ok_or_else(|| {
            NoiseError::Protocol("handshake message sequence exhausted".into())
        })?;

        let mut buffer = Vec::new();
        for &token in message {
            match token {
                Token::E => {
                    let mut secret = Zeroizing::new([0u8; 32]);
                    core.entropy.next_bytes(secret.as_mut());
                    let ephemeral = core.dh.generate_key_pair(secret.as_ref())?;
                    let public = ephemeral.public_bytes();
                    core.symmetric = core.symmetric.mix_hash(&public);
                    buffer.extend_from_slice(&public);
                    core.local_ephemeral = Some(ephemeral);
                }
                Token::S => {
                    let public = core
                        .local_static
                        .as_ref()
                        .ok_or_else(|| {
                            NoiseError::Config("local static key required by s token".into())
                        })?
                        .public_bytes();
                    let (symmetric, ciphertext) = core.symmetric.encrypt_and_hash(&public)?;
                    core.symmetric = symmetric;
                    buffer.extend_from_slice(&ciphertext);
                }
                dh_token => {
                    let secret = core.token_secret(dh_token)?;
                    core.symmetric = core.symmetric.mix_key(secret.as_ref());
                }
            }
        }

        let (symmetric, ciphertext) = core.symmetric.encrypt_and_hash(payload)?;
        core.symmetric = symmetric;
        buffer.extend_from_slice(&ciphertext);
        core.messages = remaining;

        debug!(
            target: "brontide::handshake",
            size = buffer.len(),
            remaining = remaining.len(),
            "wrote handshake message"
        );

        let transport = core.transport_keys_if_done();
        Ok((HandshakeReader(core), buffer, transport))
    }

    /// Remote static key, once learned from a pre-message or `s` token.
    #[must_use]
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.0.remote_static.as_ref()
    }
}

impl<D: DhFunctions, C: CipherFunctions + Clone, H: HashFunctions> HandshakeReader<D, C, H> {
    /// Build the responder side of a handshake; the responder listens first.
    ///
    /// # Errors
    /// Returns `NoiseError::Config` when the pattern is malformed or a key
    /// its pre-messages need is missing.
    pub fn responder(config: HandshakeConfig<D, C, H>) -> Result<Self, NoiseError> {
        Ok(Self(HandshakeCore::initialize(config, false)?))
    }

    /// Consume the head message: split its tokens off the buffer, decrypt
    /// the trailing payload, and flip into a writer. The third component is
    /// `Some` when this was the final message.
    ///
    /// # Errors
    /// `NoiseError::Authentication` on any tag mismatch,
    /// `NoiseError::Protocol` on an undersized buffer, a malformed public
    /// key, or an exhausted message list.
    pub fn read(
        self,
        message: &[u8],
    ) -> Result<(HandshakeWriter<D, C, H>, Vec<u8>, Option<TransportKeys<C>>), NoiseError> {
        let mut core = self.0;
        let messages: &'static [&'static [Token]] = core.messages;
        let (&tokens, remaining) = messages.split_first().ok_or_else(|| {
            NoiseError::Protocol("handshake message sequence exhausted".into())
        })?;

        let mut rest = message;
        for &token in tokens {
            match token {
                Token::E => {
                    let (head, tail) = split_front(rest, D::PUB_KEY_LEN)?;
                    let public = PublicKey::from_sec1_bytes(head).map_err(|e| {
                        NoiseError::Protocol(format!("invalid remote ephemeral key: {e}"))
                    })?;
                    core.symmetric = core.symmetric.mix_hash(head);
                    core.remote_ephemeral = Some(public);
                    trace!(
                        target: "brontide::handshake",
                        remote_ephemeral = %hex::encode(head),
                        "read remote ephemeral"
                    );
                    rest = tail;
                }
                Token::S => {
                    // Encrypted once the cipher is keyed, in the clear
                    // before the first mix_key.
                    let len = if core.symmetric.has_key() {
                        D::PUB_KEY_LEN + C::TAG_LEN
                    } else {
                        D::PUB_KEY_LEN
                    };
                    let (head, tail) = split_front(rest, len)?;
                    let (symmetric, plaintext) = core.symmetric.decrypt_and_hash(head)?;
                    core.symmetric = symmetric;
                    let public = PublicKey::from_sec1_bytes(&plaintext).map_err(|e| {
                        NoiseError::Protocol(format!("invalid remote static key: {e}"))
                    })?;
                    core.remote_static = Some(public);
                    rest = tail;
                }
                dh_token => {
                    let secret = core.token_secret(dh_token)?;
                    core.symmetric = core.symmetric.mix_key(secret.as_ref());
                }
            }
        }

        let (symmetric, payload) = core.symmetric.decrypt_and_hash(rest)?;
        core.symmetric = symmetric;
        core.messages = remaining;

        debug!(
            target: "brontide::handshake",
            payload = payload.len(),
            remaining = remaining.len(),
            "read handshake message"
        );

        let transport = core.transport_keys_if_done();
        Ok((HandshakeWriter(core), payload, transport))
    }

    /// Remote static key, once learned from a pre-message or `s` token.
    #[must_use]
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.0.remote_static.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{NN, XK};
    use crate::primitives::{ChaChaPoly, Secp256k1, Sha256Hash};

    /// Entropy that replays a fixed byte block for every draw.
    struct FixedEntropy([u8; 32]);

    impl ByteSource for FixedEntropy {
        fn next_bytes(&mut self, out: &mut [u8]) {
            for (dst, src) in out.iter_mut().zip(self.0.iter().cycle()) {
                *dst = *src;
            }
        }
    }

    fn config(
        pattern: HandshakePattern,
        local_static: Option<KeyPair>,
        remote_static: Option<PublicKey>,
        ephemeral_seed: [u8; 32],
    ) -> HandshakeConfig<Secp256k1, ChaChaPoly, Sha256Hash> {
        HandshakeConfig {
            pattern,
            prologue: b"test prologue".to_vec(),
            local_static,
            local_ephemeral: None,
            remote_static,
            remote_ephemeral: None,
            dh: Secp256k1,
            cipher: ChaChaPoly,
            hash: Sha256Hash,
            entropy: Box::new(FixedEntropy(ephemeral_seed)),
        }
    }

    fn keys_match(a: &TransportKeys<ChaChaPoly>, b: &TransportKeys<ChaChaPoly>) {
        assert_eq!(
            a.send.key().unwrap().as_bytes(),
            b.recv.key().unwrap().as_bytes()
        );
        assert_eq!(
            a.recv.key().unwrap().as_bytes(),
            b.send.key().unwrap().as_bytes()
        );
        assert_eq!(a.chaining_key.as_bytes(), b.chaining_key.as_bytes());
    }

    #[test]
    fn nn_lockstep_converges() {
        let writer =
            HandshakeWriter::initiator(config(NN, None, None, [0x01u8; 32])).unwrap();
        let reader =
            HandshakeReader::responder(config(NN, None, None, [0x02u8; 32])).unwrap();

        let (initiator, act_one, done) = writer.write(b"").unwrap();
        assert_eq!(act_one.len(), 33);
        assert!(done.is_none());

        let (responder, payload, done) = reader.read(&act_one).unwrap();
        assert!(payload.is_empty());
        assert!(done.is_none());

        let (responder, act_two, responder_keys) = responder.write(b"").unwrap();
        assert_eq!(act_two.len(), 33 + 16);
        let responder_keys = responder_keys.unwrap();

        let (_, payload, initiator_keys) = initiator.read(&act_two).unwrap();
        assert!(payload.is_empty());
        let initiator_keys = initiator_keys.unwrap();

        keys_match(&initiator_keys, &responder_keys);

        // Exhausted pattern: one more step on either side must fail.
        let err = responder.read(&[]).map(|_| ()).unwrap_err();
        assert!(matches!(err, NoiseError::Protocol(_)));
    }

    #[test]
    fn xk_lockstep_converges_and_authenticates() {
        let initiator_static = Secp256k1.generate_key_pair(&[0x05u8; 32]).unwrap();
        let responder_static = Secp256k1.generate_key_pair(&[0x06u8; 32]).unwrap();

        let writer = HandshakeWriter::initiator(config(
            XK,
            Some(initiator_static.clone()),
            Some(*responder_static.public()),
            [0x0Au8; 32],
        ))
        .unwrap();
        let reader = HandshakeReader::responder(config(
            XK,
            Some(responder_static),
            None,
            [0x0Bu8; 32],
        ))
        .unwrap();

        let (initiator, act_one, _) = writer.write(b"").unwrap();
        let (responder, _, _) = reader.read(&act_one).unwrap();
        let (responder, act_two, _) = responder.write(b"").unwrap();
        let (initiator, _, initiator_keys) = initiator.read(&act_two).unwrap();
        let (_, act_three, initiator_keys2) = initiator.write(b"").unwrap();
        // Completion fires on the final write for the initiator.
        assert!(initiator_keys.is_none());
        let initiator_keys = initiator_keys2.unwrap();
        let (responder, _, responder_keys) = responder.read(&act_three).unwrap();
        let responder_keys = responder_keys.unwrap();

        keys_match(&initiator_keys, &responder_keys);

        // The responder only learns the initiator's identity in act three.
        assert_eq!(
            crate::primitives::compress(responder.remote_static().unwrap()),
            initiator_static.public_bytes()
        );
    }

    #[test]
    fn xk_initiator_requires_remote_static() {
        let local = Secp256k1.generate_key_pair(&[0x05u8; 32]).unwrap();
        let err = HandshakeWriter::initiator(config(XK, Some(local), None, [0x0Au8; 32]))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, NoiseError::Config(_)));
    }
}
