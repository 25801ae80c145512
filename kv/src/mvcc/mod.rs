pub mod mvcc;
mod scan;
pub mod transaction;

#[cfg(test)]
mod transaction_test;

pub use mvcc::{Key, MVCC, MVCCDef, Status};
pub use transaction::{Transaction, TransactionDef, TransactionState};

/// An MVCC version represents a logical timestamp. The latest version is incremented
/// when beginning each read-write transaction.
pub type Version = u64;
