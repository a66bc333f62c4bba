//! Main Crate Error

use crate::common::Tag;

/// Alias for a `Result` with the crate error type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
/// Ringroute crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The frame declared more payload bytes than arrived before end-of-stream.
    #[error("Truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    /// Envelope bytes that don't even cover the fixed header.
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A field declared a type byte this decoder doesn't know.
    #[error("Unknown field type: {0:#04x}")]
    UnknownFieldType(u8),

    /// A field's contents could not be decoded as its declared type.
    #[error("Failed to decode field: {0}")]
    FieldDecode(&'static str),

    /// The envelope carried a signature for a different overlay instance.
    #[error("Foreign overlay signature")]
    SignatureMismatch,

    /// The tag byte doesn't map to any known message kind.
    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    /// A reply arrived with a tag the sender did not expect.
    #[error("Unexpected reply tag: expected {expected:?}, got {got:?}")]
    UnexpectedReply { expected: Tag, got: Tag },

    /// An envelope field list exceeded the 1-byte field count.
    #[error("Too many envelope fields: {0} > 255")]
    TooManyFields(usize),

    /// Identifier bytes of the wrong length for the configured id size.
    #[error("Invalid identifier size: expected {expected} bytes, got {got}")]
    InvalidIdSize { expected: usize, got: usize },

    /// No transport endpoint is reachable at the destination address.
    #[error("Peer unreachable: {0}")]
    Unreachable(std::net::SocketAddr),

    /// A blocking send did not see a reply within the timeout.
    #[error("Request timed out")]
    Timeout,

    /// No candidates left and the lookup did not converge.
    #[error("No route to target")]
    NoRoute,

    /// Configuration named an algorithm the registry doesn't know.
    #[error("Unknown routing algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Join was attempted against a contact that never answered.
    #[error("Join failed: {0}")]
    JoinFailed(&'static str),

    /// The node is stopped or suspended and cannot serve the call.
    #[error("Node is not running")]
    NotRunning,
}
