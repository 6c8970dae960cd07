//! Handshake pattern descriptors.
//!
//! A message is an ordered token list; a pattern is its name, the
//! pre-messages each side contributes, and the message sequence. Only the
//! two patterns Lightning needs are catalogued: XK for production and NN as
//! an unauthenticated fixture.

use crate::NoiseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    E,
    S,
    Ee,
    Es,
    Se,
    Ss,
}

#[derive(Clone, Copy, Debug)]
pub struct HandshakePattern {
    pub name: &'static str,
    pub initiator_pre_messages: &'static [Token],
    pub responder_pre_messages: &'static [Token],
    pub messages: &'static [&'static [Token]],
}

/// `-> e`, `<- e, ee`. No authentication; used to exercise the state
/// machine without static keys.
pub const NN: HandshakePattern = HandshakePattern {
    name: "NN",
    initiator_pre_messages: &[],
    responder_pre_messages: &[],
    messages: &[&[Token::E], &[Token::E, Token::Ee]],
};

/// `-> e, es`, `<- e, ee`, `-> s, se`, with the responder's static key
/// known to the initiator up front. The BOLT #8 handshake.
pub const XK: HandshakePattern = HandshakePattern {
    name: "XK",
    initiator_pre_messages: &[],
    responder_pre_messages: &[Token::S],
    messages: &[
        &[Token::E, Token::Es],
        &[Token::E, Token::Ee],
        &[Token::S, Token::Se],
    ],
};

impl HandshakePattern {
    /// Pre-message lists may only be ``, `e`, `s`, or `e, s`.
    pub(crate) fn validate(&self) -> Result<(), NoiseError> {
        for pre in [self.initiator_pre_messages, self.responder_pre_messages] {
            if !matches!(
                pre,
                [] | [Token::E] | [Token::S] | [Token::E, Token::S]
            ) {
                return Err(NoiseError::Config(format!(
                    "illegal pre-message sequence in pattern {}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
