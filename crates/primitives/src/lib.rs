//! Bitcoin block and transaction decoding plus address extraction.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod transaction;

pub use address::{input_address, p2pkh_script, script_pubkey_to_address, AddressError};
pub use block::{Block, BlockDecodeError, BlockHeader, HEADER_SIZE};
pub use hash::{hash160, sha256d};
pub use transaction::{OutPoint, Transaction, TransactionDecodeError, TxIn, TxOut};
