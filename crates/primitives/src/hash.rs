use blkgraph_consensus::Hash256;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Double SHA-256, the id of blocks and transactions.
pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

/// RIPEMD-160 of SHA-256, the payload of P2PKH and P2WPKH addresses.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(sha256d(b"")[..4], [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn hash160_of_empty_input() {
        assert_eq!(hash160(b"")[..4], [0xb4, 0x72, 0xa2, 0x66]);
    }
}
