use std::io;
use thiserror::Error;

/// Errors produced by buffers, address codecs and the Trojan protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad command byte, missing delimiter or otherwise unparsable header
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Wire tag not present in the serializer's family table
    #[error("unknown address family: {0}")]
    UnknownAddressFamily(u8),

    /// Domain names are length-prefixed with a single byte
    #[error("fqdn too long: {0} bytes")]
    FqdnTooLong(usize),

    /// Key not found in the user registry
    #[error("authentication failed: unknown key")]
    AuthFailure,

    /// Source ended before the requested number of bytes arrived
    #[error("short read")]
    ShortRead,

    /// Destination does not have room for the incoming bytes
    #[error("short buffer: need {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    /// `extend_header` asked for more bytes than the buffer reserved in front
    #[error("headroom exhausted: need {needed} bytes, {available} available")]
    HeadroomExhausted { needed: usize, available: usize },

    #[error("user already exists")]
    UserExists,

    #[error("password used by {0}")]
    PasswordReused(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach a short description of the step that failed.
    pub fn context(self, context: &'static str) -> Self {
        Error::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping `Context` layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Header-level protocol violations.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self.root(),
            Error::MalformedHeader(_) | Error::UnknownAddressFamily(_) | Error::FqdnTooLong(_)
        )
    }

    pub fn is_closed_or_canceled(&self) -> bool {
        is_closed_or_canceled(self)
    }

    /// Map an EOF from `read_exact` to `ShortRead`, keep everything else.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::ShortRead
        } else {
            Error::Io(err)
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::ShortRead => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            Error::Canceled => io::Error::new(io::ErrorKind::Interrupted, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

/// Whether an error only says the peer went away or the operation was canceled.
///
/// Walks the whole `source()` chain so wrapped transport errors are still
/// recognised. Callers use this to keep ordinary disconnects out of warning logs.
pub fn is_closed_or_canceled(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(e) = err.downcast_ref::<Error>() {
            // Context layers box their source, so jump straight to the root.
            match e.root() {
                Error::ShortRead | Error::Canceled => return true,
                Error::Io(io) => {
                    current = Some(io);
                    continue;
                }
                _ => return false,
            }
        }
        if let Some(e) = err.downcast_ref::<io::Error>() {
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ) {
                return true;
            }
            // io::Error::source skips the wrapped error itself
            if let Some(inner) = e.get_ref() {
                current = Some(inner);
                continue;
            }
        }
        if err.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// `anyhow` flavour of [`is_closed_or_canceled`].
pub fn is_closed_or_canceled_any(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| is_closed_or_canceled(cause))
}
