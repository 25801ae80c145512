//! Error taxonomy for the document engine. Every failure mode named in the
//! component design is its own variant so callers can match on kind rather
//! than parse strings.

use std::fmt::{self, Display, Formatter};

pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    // -- codec (C1/C2) --
    CodecCorrupt(String),
    InsufficientBytes,

    // -- raw KV engine --
    KeyNotFound,
    TxnTooBig,

    // -- meta store (C5) --
    DbNotExists,
    DbExists,
    CollectionNotExists,
    CollectionExists,
    JobNotExists,

    // -- DDL engine (C6) --
    JobsInQueueExceeded,
    DbAlreadyExists,
    IndexAlreadyExists,
    IndexNotExists,
    InvalidDdlState(String),

    // -- DML (C9/C10) --
    DocNotFound,
    DocExists,
    SequenceNotExists,
    SequenceAlreadyExists,
    SequenceClosed,
    DdlConflict,
    ListIndexOutOfRange,
    InvalidHashDataKey,
    InvalidListMetaData,
    MutateForReadonlyTxn,

    // -- sequence allocator (C4) --
    EmptyKeyword,
    EmptyKeyForHashSequence,
    EmptyFieldForHashSequence,
    ZeroBandwidth,

    /// Operation was cancelled via a context/deadline before it completed.
    Cancelled,

    /// Catch-all for I/O, lock, and serialization failures that don't have
    /// a dedicated kind of their own.
    Internal(String),
    Parse(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::CodecCorrupt(msg) => write!(f, "codec corrupt: {}", msg),
            Error::InsufficientBytes => write!(f, "insufficient bytes to decode value"),
            Error::KeyNotFound => write!(f, "key not found"),
            Error::TxnTooBig => write!(f, "transaction too big"),
            Error::DbNotExists => write!(f, "database not exists"),
            Error::DbExists => write!(f, "database exists"),
            Error::CollectionNotExists => write!(f, "collection not exists"),
            Error::CollectionExists => write!(f, "collection exists"),
            Error::JobNotExists => write!(f, "job not exists"),
            Error::JobsInQueueExceeded => write!(f, "too many jobs in ddl queue"),
            Error::DbAlreadyExists => write!(f, "database already exists"),
            Error::IndexAlreadyExists => write!(f, "index already exists"),
            Error::IndexNotExists => write!(f, "index not exists"),
            Error::InvalidDdlState(msg) => write!(f, "invalid ddl state: {}", msg),
            Error::DocNotFound => write!(f, "document not found"),
            Error::DocExists => write!(f, "document exists"),
            Error::SequenceNotExists => write!(f, "sequence not exists"),
            Error::SequenceAlreadyExists => write!(f, "sequence already exists"),
            Error::SequenceClosed => write!(f, "sequence is closed"),
            Error::DdlConflict => write!(f, "ddl conflict, retry the transaction"),
            Error::ListIndexOutOfRange => write!(f, "list index out of range"),
            Error::InvalidHashDataKey => write!(f, "invalid hash data key"),
            Error::InvalidListMetaData => write!(f, "invalid list meta data"),
            Error::MutateForReadonlyTxn => write!(f, "mutate called on a read-only transaction"),
            Error::EmptyKeyword => write!(f, "keyword cannot be empty for string sequence"),
            Error::EmptyKeyForHashSequence => write!(f, "key cannot be empty for hash sequence"),
            Error::EmptyFieldForHashSequence => write!(f, "field cannot be empty for hash sequence"),
            Error::ZeroBandwidth => write!(f, "bandwidth must be greater than zero"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::KeyNotFound
        } else {
            Error::Internal(err.to_string())
        }
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
        assert_eq!(Error::DdlConflict.to_string(), "ddl conflict, retry the transaction");
    }
}
