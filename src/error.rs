use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The key (or hash field / set member) does not exist.
    KeyNotFound,
    /// The key exists but its deadline has passed.
    KeyExpired,
    /// A list index fell outside the live sequence window. Distinct from
    /// KeyNotFound so callers can tell "no such list" from "bad index".
    WrongIndex,
    /// A variadic operation received a malformed argument count.
    WrongNumberOfArgs,
    /// A TTL of zero or less was supplied.
    InvalidTtl,
    /// A batch exceeded its configured pending-write limit.
    BatchTooLarge,
    /// Another process holds the database directory lock.
    DirLocked,
    /// On-disk data failed validation, typically a CRC mismatch.
    Corrupt(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::KeyExpired => write!(f, "key expired"),
            Error::WrongIndex => write!(f, "list index out of range"),
            Error::WrongNumberOfArgs => write!(f, "wrong number of arguments"),
            Error::InvalidTtl => write!(f, "invalid ttl"),
            Error::BatchTooLarge => write!(f, "batch exceeds configured size"),
            Error::DirLocked => write!(f, "database directory is locked by another process"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
