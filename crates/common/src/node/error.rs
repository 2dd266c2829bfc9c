/// Error text a branch reports for a missing file or directory. The
/// transport recognises it so callers can tell "not there" apart from
/// "broken".
pub const ERR_NOT_EXIST: &str = "file does not exist";

/// Error text reported when a read runs past the end of a file.
/// Streaming loops use it as their termination signal.
pub const ERR_EOF: &str = "EOF";

/// A transport-level error.
///
/// `Network` failures are the only retryable kind (a single redial).
/// `Remote` wraps whatever text the remote data handler produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Dial, TLS or connection-level failure.
    #[error("Network error ({0})")]
    Network(String),

    /// Error reported by the remote data handler.
    #[error("Remote error ({detail})")]
    Remote { detail: String, is_not_exist: bool },

    /// The addressed node is not registered at the callee (or locally).
    #[error("Unknown target node ({0})")]
    UnknownTarget(String),

    /// The peer presented a certificate that does not match its pinned
    /// fingerprint. Carries the peer name.
    #[error("Unexpected SSL certificate from target node ({0})")]
    Untrusted(String),

    /// The presented auth token did not verify.
    #[error("Invalid node token")]
    InvalidToken,

    /// Local usage error (registration, unexpected reply shape).
    #[error("{0}")]
    Local(String),
}

impl Error {
    /// Wrap a remote error text, flagging the not-exists sentinel.
    pub fn remote(detail: impl Into<String>) -> Error {
        let detail = detail.into();
        let is_not_exist = detail == ERR_NOT_EXIST;
        Error::Remote {
            detail,
            is_not_exist,
        }
    }

    /// The canonical not-exists error.
    pub fn not_exist() -> Error {
        Error::remote(ERR_NOT_EXIST)
    }

    /// The canonical end-of-file error.
    pub fn eof() -> Error {
        Error::remote(ERR_EOF)
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(
            self,
            Error::Remote {
                is_not_exist: true,
                ..
            }
        )
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Remote { detail, .. } if detail == ERR_EOF)
    }
}
