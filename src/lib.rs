#![deny(unsafe_code)]

//! BOLT #8 transport encryption for Lightning Network peers.
//!
//! Implements the Noise Protocol Framework instantiated as
//! `Noise_XK_secp256k1_ChaChaPoly_SHA256`, the handshake every Lightning
//! node runs before exchanging wire messages. The crate is layered the way
//! the protocol is: primitive function families, a cipher state, a symmetric
//! state, and a handshake state machine that emits the pair of transport
//! cipher states on completion. [`machine::Machine`] adds the BOLT #8
//! profile on top: the act version byte, encrypted length headers, and key
//! rotation every 1000 messages.
//!
//! Example (initiator side over any `Read + Write` stream)
//! ```no_run
//! use brontide::machine::{Machine, MachineConfig};
//! use brontide::primitives::KeyPair;
//! use k256::SecretKey;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let local_static = KeyPair::from_secret(SecretKey::random(&mut rand::thread_rng()));
//! let remote_static = k256::PublicKey::from_sec1_bytes(&hex::decode(
//!     "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7",
//! )?)?;
//! let mut stream = std::net::TcpStream::connect("127.0.0.1:9735")?;
//! let mut machine = Machine::new(MachineConfig {
//!     initiator: true,
//!     local_static,
//!     remote_static: Some(remote_static),
//!     entropy: None,
//! })?;
//! machine.do_handshake(&mut stream)?;
//! machine.write_message(b"init")?;
//! machine.flush(&mut stream)?;
//! let reply = machine.read_message(&mut stream)?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod cipher_state;
pub mod handshake;
pub mod machine;
pub mod pattern;
pub mod primitives;
pub mod symmetric_state;

pub use cipher_state::{CipherState, SymmetricKey};
pub use handshake::{
    ByteSource, HandshakeConfig, HandshakeReader, HandshakeWriter, OsEntropy, TransportKeys,
};
pub use machine::{Machine, MachineConfig};
pub use pattern::{HandshakePattern, Token, NN, XK};
pub use primitives::{ChaChaPoly, KeyPair, Secp256k1, Sha256Hash};
pub use symmetric_state::SymmetricState;

/// Prologue mixed into the transcript before act one, per BOLT #8.
pub const LIGHTNING_PROLOGUE: &[u8] = b"lightning";

#[derive(thiserror::Error, Debug)]
pub enum NoiseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// AEAD tag verification failed. Carries no detail about whether the key
    /// or the tag was wrong.
    #[error("authentication failed")]
    Authentication,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("crypto error: {0}")]
    Crypto(String),
}
