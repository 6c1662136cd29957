//! Error types for core codecs and key material.

/// Errors from address parsing, identity serialization, and the control
/// and dictionary codecs.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid overlay address: {0}")]
    InvalidAddress(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("identity has no private key")]
    NoPrivateKey,
    #[error("control packet truncated: {0} bytes")]
    Truncated(usize),
    #[error("control packet authentication failed")]
    BadAuthTag,
    #[error("control payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("conversation id must be non-zero")]
    ZeroConversationId,
    #[error("command line of {0} bytes exceeds one control packet")]
    OversizeLine(usize),
    #[error("command line contains an embedded newline")]
    EmbeddedNewline,
    #[error("dictionary syntax error: {0}")]
    DictionarySyntax(String),
}
