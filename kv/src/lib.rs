#![allow(non_camel_case_types)]

//! `docdb` is an embedded document database layered on top of an ordered,
//! transactional key-value engine (`storage` + `mvcc`). It owns its own
//! on-disk key encodings (`codec`), structured data types built on the raw
//! KV byte space (`document::structure`), and a catalog of
//! databases/collections with online schema changes (`document::meta`,
//! `document::ddl`), all driven through snapshot-isolated transactions
//! (`document::txn`).
//!
//! ## Getting started
//!
//! ```rust
//! use std::path::PathBuf;
//! use docdb::error::Error;
//! use docdb::storage::engine::Engine;
//! use docdb::storage::log_cask::LogCask;
//!
//! fn run() -> Result<(), Error> {
//!     let storage_path = tempdir::TempDir::new("demo")?.path().join("kvdb");
//!     let mut engine = LogCask::new(storage_path)?;
//!     engine.set(b"a", vec![0x01])?;
//!     assert_eq!(engine.get(b"a")?, Some(vec![0x01]));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;
pub mod codec;
pub mod mvcc;
pub mod document;

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::storage::engine::Engine;
    use crate::storage::log_cask::LogCask;

    #[test]
    fn run() -> Result<(), Error> {
        let path = tempdir::TempDir::new("demo")?.path().join("whosdb");

        let mut engine = LogCask::new(path)?;
        engine.set(b"b", vec![0x01])?;
        engine.set(b"b", vec![0x02])?;

        engine.set(b"e", vec![0x05])?;
        engine.delete(b"e")?;

        engine.set(b"c", vec![0x00])?;
        engine.delete(b"c")?;
        engine.set(b"c", vec![0x03])?;

        engine.set(b"", vec![])?;
        engine.set(b"a", vec![0x01])?;
        engine.delete(b"f")?;
        engine.delete(b"d")?;
        engine.set(b"d", vec![0x04])?;

        assert_eq!(
            vec![
                (b"".to_vec(), vec![]),
                (b"a".to_vec(), vec![0x01]),
                (b"b".to_vec(), vec![0x02]),
                (b"c".to_vec(), vec![0x03]),
                (b"d".to_vec(), vec![0x04]),
            ],
            engine.scan(..).collect::<Result<Vec<_>, Error>>()?,
        );

        engine.flush()?;
        Ok(())
    }
}
