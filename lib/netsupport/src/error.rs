use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors shared across the codec, connection and registry layers.
///
/// `Wait` is not really an error: it signals "not enough data yet" or "would
/// block" and callers are expected to retry later rather than tear anything
/// down. Everything else is `Fatal` and closes whatever it touched.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A record carried a negative length field.
    NegativeLength,
    /// A record referenced a packet id with no registered mapping.
    UnmappedPacketId(i32),
    /// A 4-byte magic prefix didn't match any known record kind.
    UnknownMagic(i32),
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorKind::AddrParse)
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "would block"),
            NetworkError::Fatal(kind) => write!(f, "fatal network error: {:?}", kind),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Convenience extension mirroring the existing `has_failed` check used across the
/// connection layer: a `Wait` is not a failure, everything else is.
pub trait ResultExt {
    fn has_failed(&self) -> bool;
}

impl<T> ResultExt for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}
