//! The BOLT #8 profile: act framing, encrypted length headers, rotation.
//!
//! [`Machine`] drives the `Noise_XK` handshake over any blocking
//! `Read + Write` stream, prepending and checking the single handshake
//! version byte, then frames transport messages as an AEAD-encrypted
//! 2-byte big-endian length followed by the encrypted body. Transport keys
//! are rotated every [`KEY_ROTATION_INTERVAL`] AEAD operations, salted with
//! the handshake's final chaining key.

use std::io::{Read, Write};

use k256::PublicKey;
use tracing::debug;

use crate::cipher_state::SymmetricKey;
use crate::handshake::{
    ByteSource, HandshakeConfig, HandshakeReader, HandshakeWriter, OsEntropy, TransportKeys,
};
use crate::pattern::XK;
use crate::primitives::{ChaChaPoly, CipherFunctions, HashFunctions, KeyPair, Secp256k1, Sha256Hash};
use crate::{NoiseError, LIGHTNING_PROLOGUE};

/// The only handshake version BOLT #8 defines.
pub const HANDSHAKE_VERSION: u8 = 0;
pub const ACT_ONE_SIZE: usize = 50;
pub const ACT_TWO_SIZE: usize = 50;
pub const ACT_THREE_SIZE: usize = 66;

pub const MAC_SIZE: usize = 16;
pub const LENGTH_HEADER_SIZE: usize = 2;
pub const ENC_HEADER_SIZE: usize = LENGTH_HEADER_SIZE + MAC_SIZE;

/// AEAD operations a transport key performs before it is rotated.
pub const KEY_ROTATION_INTERVAL: u64 = 1000;

type Writer = HandshakeWriter<Secp256k1, ChaChaPoly, Sha256Hash>;
type Reader = HandshakeReader<Secp256k1, ChaChaPoly, Sha256Hash>;

enum Role {
    Writer(Writer),
    Reader(Reader),
}

impl Role {
    fn remote_static(&self) -> Option<PublicKey> {
        match self {
            Role::Writer(writer) => writer.remote_static().copied(),
            Role::Reader(reader) => reader.remote_static().copied(),
        }
    }
}

/// One direction of post-handshake traffic: key, rotation salt, nonce.
struct TransportCipher {
    key: SymmetricKey,
    salt: SymmetricKey,
    nonce: u64,
}

impl TransportCipher {
    fn from_split(
        state: &crate::cipher_state::CipherState<ChaChaPoly>,
        salt: &SymmetricKey,
    ) -> Result<Self, NoiseError> {
        let key = state
            .key()
            .cloned()
            .ok_or_else(|| NoiseError::Crypto("split produced an unkeyed state".into()))?;
        Ok(Self {
            key,
            salt: salt.clone(),
            nonce: 0,
        })
    }

    fn encrypt(&mut self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext =
            ChaChaPoly.encrypt(self.key.as_bytes(), self.nonce, associated_data, plaintext)?;
        self.advance();
        Ok(ciphertext)
    }

    fn decrypt(
        &mut self,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let plaintext =
            ChaChaPoly.decrypt(self.key.as_bytes(), self.nonce, associated_data, ciphertext)?;
        self.advance();
        Ok(plaintext)
    }

    fn advance(&mut self) {
        self.nonce += 1;
        if self.nonce == KEY_ROTATION_INTERVAL {
            self.rotate_key();
        }
    }

    /// `(salt', k') = HKDF(salt, k)`, nonce back to zero.
    fn rotate_key(&mut self) {
        let (salt, key) = Sha256Hash.hkdf(self.salt.as_bytes(), self.key.as_bytes());
        self.salt = SymmetricKey(*salt);
        self.key = SymmetricKey(*key);
        self.nonce = 0;
        debug!(target: "brontide::machine", "rotated transport key");
    }
}

/// Configuration for a [`Machine`].
pub struct MachineConfig {
    /// Whether this side opens the connection and speaks act one.
    pub initiator: bool,
    /// Local static identity key.
    pub local_static: KeyPair,
    /// Remote static identity key; required for the initiator, learned
    /// during act three by the responder.
    pub remote_static: Option<PublicKey>,
    /// Entropy override for ephemeral keys; `None` uses the process CSPRNG.
    pub entropy: Option<Box<dyn ByteSource + Send>>,
}

/// A BOLT #8 endpoint: runs the XK handshake, then encrypts and decrypts
/// length-framed transport messages.
pub struct Machine {
    initiator: bool,
    handshake: Option<Role>,
    remote_static: Option<PublicKey>,
    send_cipher: Option<TransportCipher>,
    recv_cipher: Option<TransportCipher>,
    next_header_send: Vec<u8>,
    next_body_send: Vec<u8>,
}

impl Machine {
    /// Construct a machine ready to run its handshake.
    ///
    /// # Errors
    /// `NoiseError::Config` when the initiator is missing the remote static
    /// key.
    pub fn new(config: MachineConfig) -> Result<Self, NoiseError> {
        if config.initiator && config.remote_static.is_none() {
            return Err(NoiseError::Config(
                "initiator requires the remote static key".into(),
            ));
        }
        let remote_static = config.remote_static;
        let handshake_config = HandshakeConfig {
            pattern: XK,
            prologue: LIGHTNING_PROLOGUE.to_vec(),
            local_static: Some(config.local_static),
            local_ephemeral: None,
            remote_static,
            remote_ephemeral: None,
            dh: Secp256k1,
            cipher: ChaChaPoly,
            hash: Sha256Hash,
            entropy: config.entropy.unwrap_or_else(|| Box::new(OsEntropy)),
        };
        let handshake = if config.initiator {
            Role::Writer(HandshakeWriter::initiator(handshake_config)?)
        } else {
            Role::Reader(HandshakeReader::responder(handshake_config)?)
        };
        Ok(Self {
            initiator: config.initiator,
            handshake: Some(handshake),
            remote_static,
            send_cipher: None,
            recv_cipher: None,
            next_header_send: Vec::new(),
            next_body_send: Vec::new(),
        })
    }

    /// Run the three acts over the supplied stream and install the
    /// transport keys.
    ///
    /// # Errors
    /// Propagates IO failures and every terminal handshake error; the
    /// machine is unusable afterwards.
    pub fn do_handshake<RW: Read + Write>(&mut self, rw: &mut RW) -> Result<(), NoiseError> {
        let mut role = self
            .handshake
            .take()
            .ok_or_else(|| NoiseError::Protocol("handshake already completed".into()))?;

        let mut keys = None;
        for act in 1u8..=3 {
            let size = act_size(act);
            match role {
                Role::Writer(writer) => {
                    let (reader, body, done) = writer.write(&[])?;
                    let mut message = Vec::with_capacity(1 + body.len());
                    message.push(HANDSHAKE_VERSION);
                    message.extend_from_slice(&body);
                    debug_assert_eq!(message.len(), size);
                    rw.write_all(&message)?;
                    rw.flush()?;
                    debug!(target: "brontide::machine", act, size = message.len(), "sent act");
                    keys = done;
                    role = Role::Reader(reader);
                }
                Role::Reader(reader) => {
                    let mut message = vec![0u8; size];
                    rw.read_exact(&mut message)?;
                    if message[0] != HANDSHAKE_VERSION {
                        return Err(NoiseError::Protocol(format!(
                            "unsupported handshake version {}",
                            message[0]
                        )));
                    }
                    let (writer, _, done) = reader.read(&message[1..])?;
                    debug!(target: "brontide::machine", act, size = message.len(), "read act");
                    keys = done;
                    role = Role::Writer(writer);
                }
            }
        }

        let TransportKeys {
            send,
            recv,
            chaining_key,
        } = keys.ok_or_else(|| NoiseError::Protocol("handshake did not complete".into()))?;
        self.send_cipher = Some(TransportCipher::from_split(&send, &chaining_key)?);
        self.recv_cipher = Some(TransportCipher::from_split(&recv, &chaining_key)?);
        self.remote_static = role.remote_static();
        debug!(
            target: "brontide::machine",
            initiator = self.initiator,
            "handshake complete"
        );
        Ok(())
    }

    /// Remote static identity; for the responder this is only available
    /// after the handshake completes.
    #[must_use]
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    /// Queue an encrypted payload to be flushed out on the transport.
    ///
    /// # Errors
    /// `NoiseError::Protocol` when the handshake is incomplete, the payload
    /// exceeds 65535 bytes, or the previous payload has not been flushed.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<(), NoiseError> {
        let cipher = self
            .send_cipher
            .as_mut()
            .ok_or_else(|| NoiseError::Protocol("handshake not complete".into()))?;
        let length = u16::try_from(payload.len())
            .map_err(|_| NoiseError::Protocol("payload exceeds 65535 bytes".into()))?;
        if !self.next_body_send.is_empty() {
            return Err(NoiseError::Protocol("previous payload not flushed".into()));
        }
        self.next_header_send = cipher.encrypt(&[], &length.to_be_bytes())?;
        self.next_body_send = cipher.encrypt(&[], payload)?;
        Ok(())
    }

    /// Flush the pending encrypted payload, returning the plaintext length
    /// written.
    ///
    /// # Errors
    /// Propagates IO failures from the writer.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> Result<usize, NoiseError> {
        if self.next_header_send.is_empty() && self.next_body_send.is_empty() {
            return Ok(0);
        }
        writer.write_all(&self.next_header_send)?;
        self.next_header_send.clear();
        let payload_len = self.next_body_send.len().saturating_sub(MAC_SIZE);
        writer.write_all(&self.next_body_send)?;
        self.next_body_send.clear();
        Ok(payload_len)
    }

    /// Read and decrypt the length header of the next message, returning
    /// the number of ciphertext bytes (MAC included) that follow.
    ///
    /// # Errors
    /// `NoiseError::Protocol` when the handshake is incomplete,
    /// `NoiseError::Authentication` when the header does not verify.
    pub fn read_header<R: Read>(&mut self, reader: &mut R) -> Result<usize, NoiseError> {
        let cipher = self
            .recv_cipher
            .as_mut()
            .ok_or_else(|| NoiseError::Protocol("handshake not complete".into()))?;
        let mut header = [0u8; ENC_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let length_bytes = cipher.decrypt(&[], &header)?;
        if length_bytes.len() != LENGTH_HEADER_SIZE {
            return Err(NoiseError::Protocol("invalid length header".into()));
        }
        let length = u16::from_be_bytes([length_bytes[0], length_bytes[1]]) as usize;
        Ok(length + MAC_SIZE)
    }

    /// Read and decrypt a ciphertext body of the size returned by
    /// [`Self::read_header`].
    ///
    /// # Errors
    /// `NoiseError::Authentication` when the body does not verify.
    pub fn read_body<R: Read>(
        &mut self,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let cipher = self
            .recv_cipher
            .as_mut()
            .ok_or_else(|| NoiseError::Protocol("handshake not complete".into()))?;
        reader.read_exact(buf)?;
        cipher.decrypt(&[], buf)
    }

    /// Read a complete message: header, then body.
    ///
    /// # Errors
    /// Propagates errors from [`Self::read_header`] and [`Self::read_body`].
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Vec<u8>, NoiseError> {
        let body_len = self.read_header(reader)?;
        let mut buf = vec![0u8; body_len];
        self.read_body(reader, &mut buf)
    }
}

fn act_size(act: u8) -> usize {
    match act {
        1 => ACT_ONE_SIZE,
        2 => ACT_TWO_SIZE,
        _ => ACT_THREE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::SecretKey;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone)]
    struct InMemoryStream {
        recv: Arc<Mutex<VecDeque<u8>>>,
        send: Arc<Mutex<VecDeque<u8>>>,
    }

    impl InMemoryStream {
        fn pair() -> (Self, Self) {
            let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
            let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
            let a = Self {
                recv: b_to_a.clone(),
                send: a_to_b.clone(),
            };
            let b = Self {
                recv: a_to_b,
                send: b_to_a,
            };
            (a, b)
        }
    }

    impl Read for InMemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                if let Some(n) = {
                    let mut recv = self.recv.lock().unwrap();
                    if recv.is_empty() {
                        None
                    } else {
                        let n = buf.len().min(recv.len());
                        for (dst, value) in buf.iter_mut().take(n).zip(recv.drain(..n)) {
                            *dst = value;
                        }
                        Some(n)
                    }
                } {
                    return Ok(n);
                }
                thread::yield_now();
            }
        }
    }

    impl Write for InMemoryStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut send = self.send.lock().unwrap();
            send.extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn random_static() -> KeyPair {
        KeyPair::from_secret(SecretKey::random(&mut rand::thread_rng()))
    }

    #[test]
    fn xk_handshake_and_message_roundtrip() {
        let (mut client_stream, mut server_stream) = InMemoryStream::pair();
        let client_static = random_static();
        let server_static = random_static();
        let server_public = *server_static.public();

        let mut client = Machine::new(MachineConfig {
            initiator: true,
            local_static: client_static.clone(),
            remote_static: Some(server_public),
            entropy: None,
        })
        .expect("client machine");

        let server_handle = thread::spawn(move || {
            let mut server = Machine::new(MachineConfig {
                initiator: false,
                local_static: server_static,
                remote_static: None,
                entropy: None,
            })
            .expect("server machine");
            server
                .do_handshake(&mut server_stream)
                .expect("server handshake");
            (server, server_stream)
        });

        client
            .do_handshake(&mut client_stream)
            .expect("client handshake");
        let (mut server, mut server_stream) = server_handle.join().unwrap();

        // The responder learned the initiator's identity in act three.
        assert_eq!(
            crate::primitives::compress(server.remote_static().unwrap()),
            client_static.public_bytes()
        );

        client.write_message(b"ping").expect("write");
        client.flush(&mut client_stream).expect("flush");
        assert_eq!(server.read_message(&mut server_stream).unwrap(), b"ping");

        server.write_message(b"pong").expect("write");
        server.flush(&mut server_stream).expect("flush");
        assert_eq!(client.read_message(&mut client_stream).unwrap(), b"pong");
    }

    #[test]
    fn messages_rejected_before_handshake() {
        let mut machine = Machine::new(MachineConfig {
            initiator: true,
            local_static: random_static(),
            remote_static: Some(*random_static().public()),
            entropy: None,
        })
        .unwrap();
        assert!(matches!(
            machine.write_message(b"early"),
            Err(NoiseError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        // Keys installed by hand so only the length check is in play.
        let mut machine = Machine::new(MachineConfig {
            initiator: true,
            local_static: random_static(),
            remote_static: Some(*random_static().public()),
            entropy: None,
        })
        .unwrap();
        machine.send_cipher = Some(TransportCipher {
            key: SymmetricKey([1u8; 32]),
            salt: SymmetricKey([2u8; 32]),
            nonce: 0,
        });
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            machine.write_message(&payload),
            Err(NoiseError::Protocol(_))
        ));
    }

    #[test]
    fn initiator_requires_remote_static() {
        let err = Machine::new(MachineConfig {
            initiator: true,
            local_static: random_static(),
            remote_static: None,
            entropy: None,
        })
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, NoiseError::Config(_)));
    }

    #[test]
    fn transport_vectors_with_key_rotation() {
        // BOLT #8 transport-message vectors: sk and ck from the handshake
        // vector run, "hello" encrypted 1002 times. Messages 500 and 1000
        // sit just past the two key rotations.
        let sk: [u8; 32] =
            hex::decode("969ab31b4d288cedf6218839b27a3e2140827047f2c0f01bf5c04435d43511a9")
                .unwrap()
                .try_into()
                .unwrap();
        let ck: [u8; 32] =
            hex::decode("919219dbb2920afa8db80f9a51787a840bcf111ed8d588caf9ab4be716e42b01")
                .unwrap()
                .try_into()
                .unwrap();

        let mut cipher = TransportCipher {
            key: SymmetricKey(sk),
            salt: SymmetricKey(ck),
            nonce: 0,
        };

        let expected = [
            (
                0usize,
                "cf2b30ddf0cf3f80e7c35a6e6730b59fe802473180f396d88a8fb0db8cbcf25d2f214cf9ea1d95",
            ),
            (
                1,
                "72887022101f0b6753e0c7de21657d35a4cb2a1f5cde2650528bbc8f837d0f0d7ad833b1a256a1",
            ),
            (
                500,
                "178cb9d7387190fa34db9c2d50027d21793c9bc2d40b1e14dcf30ebeeeb220f48364f7a4c68bf8",
            ),
            (
                501,
                "1b186c57d44eb6de4c057c49940d79bb838a145cb528d6e8fd26dbe50a60ca2c104b56b60e45bd",
            ),
            (
                1000,
                "4a2f3cc3b5e78ddb83dcb426d9863d9d9a723b0337c89dd0b005d89f8d3c05c52b76b29b740f09",
            ),
            (
                1001,
                "2ecd8c8a5629d0d02ab457a0fdd0f7b90a192cd46be5ecb6ca570bfc5e268338b1a16cf4ef2d36",
            ),
        ];

        for i in 0..=1001usize {
            let header = cipher.encrypt(&[], &5u16.to_be_bytes()).unwrap();
            let body = cipher.encrypt(&[], b"hello").unwrap();
            let mut frame = header;
            frame.extend_from_slice(&body);
            if let Some((_, want)) = expected.iter().find(|(idx, _)| *idx == i) {
                assert_eq!(hex::encode(&frame), *want, "message {i}");
            }
        }
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let key = SymmetricKey([3u8; 32]);
        let salt = SymmetricKey([4u8; 32]);
        let mut send = TransportCipher {
            key: key.clone(),
            salt: salt.clone(),
            nonce: 0,
        };
        let mut recv = TransportCipher {
            key,
            salt,
            nonce: 0,
        };
        let mut header = send.encrypt(&[], &5u16.to_be_bytes()).unwrap();
        *header.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            recv.decrypt(&[], &header),
            Err(NoiseError::Authentication)
        ));
    }
}
