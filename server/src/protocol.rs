//! Wire types for the raw-KV RPC surface: one message
//! per command, with a stream-start flag that keeps a multi-operation
//! transaction alive across a single connection.

use serde_derive::{Deserialize, Serialize};

/// Response codes for the raw-KV RPC surface.
pub const CODE_OK: u32 = 0;
pub const CODE_INVALID_REQUEST: u32 = 1;
pub const CODE_INTERNAL: u32 = 2;
pub const CODE_TXN_TOO_BIG: u32 = 3;
pub const CODE_KEY_NOT_FOUND: u32 = 4;

/// Scans are capped to keep a single response bounded.
pub const MAX_SCAN_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub prefix: Option<Vec<u8>>,
    #[serde(default)]
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Set { key: Vec<u8>, value: Vec<u8>, meta: Option<Vec<u8>> },
    Exists { key: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    Scan { options: ScanOptions },
    Commit,
    Discard,
}

/// One frame of the client → server stream. `stream_start` is set on the
/// first frame of a connection; `update` on that first frame means
/// "begin a read-write transaction" rather than a read-only one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub stream_start: bool,
    pub update: bool,
    pub op: Op,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub code: u32,
    pub msg: String,
    pub value: Option<Vec<u8>>,
    pub meta: Option<Vec<u8>>,
    pub exists: bool,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Response {
    pub fn ok() -> Self {
        Self { code: CODE_OK, ..Default::default() }
    }

    pub fn error(code: u32, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), ..Default::default() }
    }
}

/// Maps a core [`docdb::error::Error`] onto this protocol's response codes.
pub fn code_for_error(err: &docdb::error::Error) -> u32 {
    use docdb::error::Error;
    match err {
        Error::KeyNotFound | Error::DocNotFound => CODE_KEY_NOT_FOUND,
        Error::TxnTooBig => CODE_TXN_TOO_BIG,
        _ => CODE_INTERNAL,
    }
}
