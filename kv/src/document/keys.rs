//! Key layout for the two sub-namespaces described in the data model: `META`
//! (the catalog) and `COLLECTION` (per-collection document/index data).
//!
//! Every composite key is built from the C1 memory-comparable codec so that
//! range scans over a prefix come back in the logical order callers expect
//! (ascending document IDs, ascending index names, ...).

use crate::codec::memcmp;

pub const META: &[u8] = b"M";
pub const COLLECTION: &[u8] = b"C";

/// `COLLECTION || encUint64(cid) || "_d" || encUint64(did)`
pub fn document_key(cid: u64, did: u64) -> Vec<u8> {
    let mut buf = document_prefix(cid);
    memcmp::encode_u64(&mut buf, did);
    buf
}

/// Prefix covering every document key in collection `cid`, ascending by `did`.
pub fn document_prefix(cid: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COLLECTION.len() + 8 + 2 + 8);
    buf.extend_from_slice(COLLECTION);
    memcmp::encode_u64(&mut buf, cid);
    buf.extend_from_slice(b"_d");
    buf
}

/// `COLLECTION || encUint64(cid) || "_in" || encBytes(indexName)`
pub fn index_name_to_id_key(cid: u64, index_name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COLLECTION.len() + 8 + 3 + index_name.len() + 9);
    buf.extend_from_slice(COLLECTION);
    memcmp::encode_u64(&mut buf, cid);
    buf.extend_from_slice(b"_in");
    memcmp::encode_bytes(&mut buf, index_name.as_bytes());
    buf
}

/// `META || "_i" || encUint64(iid)`: the meta index descriptor.
pub fn meta_index_descriptor_key(iid: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(META.len() + 2 + 8);
    buf.extend_from_slice(META);
    buf.extend_from_slice(b"_i");
    memcmp::encode_u64(&mut buf, iid);
    buf
}

/// `COLLECTION || encUint64(cid) || "_f"`: fingerprint of the columns
/// currently indexed on a collection. Maintained by the DDL engine so a
/// future index-data-maintenance extension can tell at a glance which
/// columns already have index support without re-reading every
/// `IndexInfo`.
pub fn columns_indexed_fingerprint_key(cid: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COLLECTION.len() + 8 + 2);
    buf.extend_from_slice(COLLECTION);
    memcmp::encode_u64(&mut buf, cid);
    buf.extend_from_slice(b"_f");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_keys_sort_by_did_ascending() {
        let a = document_key(1, 1);
        let b = document_key(1, 2);
        let c = document_key(1, 10);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn document_keys_stay_within_collection_prefix() {
        let a = document_key(1, u64::MAX);
        let b = document_key(2, 0);
        assert!(a < b);
    }

    #[test]
    fn document_prefix_bounds_only_its_own_collection() {
        let prefix = document_prefix(5);
        let key = document_key(5, 42);
        assert!(key.starts_with(&prefix));
        assert!(!document_key(6, 0).starts_with(&prefix));
    }
}
