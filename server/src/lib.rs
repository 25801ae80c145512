//! `docdb-server` fronts the `docdb` document engine with a raw-KV RPC
//! surface over TCP: length-delimited, bincode-framed requests driving a
//! per-connection transaction against the same engine the document layer
//! uses.

pub mod config;
pub mod protocol;
pub mod rpc;
pub mod trace;
