//! Error taxonomy shared by the reader, the SASL negotiator, the stream
//! management ledger and the connection layers.

use thiserror::Error;

/// Fatal stream parsing errors. Once returned, the reader keeps returning the
/// same value from every later `push`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    /// Malformed or unexpected top-level element.
    #[error("stream framing error: {0}")]
    Framing(String),
    /// The XML tokenizer rejected the input.
    #[error("XML parse error: {0}")]
    Syntax(String),
    /// Buffered bytes that do not form a complete token exceeded the limit.
    #[error("stanza buffer of {size} bytes exceeds the {limit} byte limit")]
    Overflow { size: usize, limit: usize },
}

/// Why an authentication exchange did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("server doesn't advertise any SASL mechanisms")]
    NotSupported,
    #[error("no supported SASL mechanism found")]
    NoSupportedMechanism,
    #[error("no username or password provided")]
    NoCredentials,
    /// The peer broke the expected sequence or sent a bad proof.
    #[error("server sent an invalid reply: {0}")]
    InvalidReply(String),
    /// The peer rejected the authentication; carries its condition verbatim.
    #[error("authentication failed: {0}")]
    Failure(String),
    #[error("authentication cancelled")]
    Cancelled,
    #[error("authentication exchange already finished")]
    AlreadyFinished,
    #[error("transport error during authentication: {0}")]
    Transport(String),
}

impl AuthError {
    /// True when re-prompting the user for credentials makes sense, false for
    /// protocol or mechanism problems where the connection should be dropped.
    pub fn is_credential_problem(&self) -> bool {
        match self {
            AuthError::NoCredentials => true,
            AuthError::Failure(reason) => matches!(
                reason.as_str(),
                "not-authorized" | "credentials-expired" | "account-disabled"
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmError {
    #[error("invalid stream management ack: {0}")]
    InvalidAck(String),
    #[error("stream management is not enabled")]
    NotEnabled,
    #[error("server refused stream management: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error("stream closed by peer")]
    Closed,
    #[error("unexpected stanza: {0}")]
    UnexpectedStanza(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Umbrella error for the session and STARTTLS layers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    StreamManagement(#[from] SmError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<ReaderError> for EngineError {
    fn from(err: ReaderError) -> Self {
        EngineError::Connection(ConnectionError::Reader(err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Connection(ConnectionError::Io(err))
    }
}
