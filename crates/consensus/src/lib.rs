//! Network parameters and shared chain constants.

pub mod constants;
pub mod params;

pub use constants::{GENESIS_PREV_HASH, MAX_BLOCK_SIZE, MAX_FRAME_SIZE_FACTOR};
pub use params::{chain_params, hash256_from_hex, hash256_to_hex, ChainParams, HexError, Network};

pub type Hash256 = [u8; 32];
