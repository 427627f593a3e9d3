//! Chain-wide constants shared by the scanner and the import passes.

use crate::Hash256;

/// Predecessor hash carried by the first block of a chain.
pub const GENESIS_PREV_HASH: Hash256 = [0u8; 32];
/// The maximum serialized block size the reference client accepted before segwit.
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// Frames larger than `max_frame_size * MAX_FRAME_SIZE_FACTOR` are treated as corrupt.
pub const MAX_FRAME_SIZE_FACTOR: u32 = 5;
