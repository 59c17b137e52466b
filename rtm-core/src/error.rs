use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Thrown if JSON (de)serialization failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Thrown if CBOR serialization failed
    #[error("cbor encoding failed: {0}")]
    CborEncode(String),

    /// Thrown if CBOR deserialization failed
    #[error("cbor decoding failed: {0}")]
    CborDecode(String),

    /// A text frame arrived on a binary codec, or vice versa
    #[error("expected a {expected} frame but received a {received} frame")]
    FrameMismatch {
        expected: &'static str,
        received: &'static str,
    },
}

/// Errors raised synchronously while validating endpoint credentials.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The endpoint scheme was not `ws` or `wss`
    #[error("endpoint must start with \"ws://\" or \"wss://\" but {0:?} does not")]
    BadScheme(String),

    /// The endpoint was not a parseable URL
    #[error("endpoint {0:?} is not a valid url")]
    InvalidUrl(String),

    /// The appkey was empty
    #[error("appkey must not be empty")]
    MissingAppkey,
}
