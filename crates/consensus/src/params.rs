//! Per-network parameters.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub pubkey_address_prefix: u8,
    pub script_address_prefix: u8,
    pub bech32_hrp: &'static str,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            pubkey_address_prefix: 0x00,
            script_address_prefix: 0x05,
            bech32_hrp: "bc",
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            pubkey_address_prefix: 0x6f,
            script_address_prefix: 0xc4,
            bech32_hrp: "tb",
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            pubkey_address_prefix: 0x6f,
            script_address_prefix: 0xc4,
            bech32_hrp: "bcrt",
        },
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hash length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a hash in display order (big-endian hex, optional `0x`, short input
/// left-padded with zeros) into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .as_bytes();
    if digits.is_empty() || digits.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    // Walk from the least significant digit; internal order is little-endian.
    let mut hash = [0u8; 32];
    for (slot, pair) in hash.iter_mut().zip(digits.rchunks(2)) {
        *slot = pair
            .iter()
            .try_fold(0u8, |acc, digit| Some(acc << 4 | hex_value(*digit)?))
            .ok_or(HexError::InvalidHex)?;
    }
    Ok(hash)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    hash.iter()
        .rev()
        .flat_map(|byte| [DIGITS[usize::from(byte >> 4)], DIGITS[usize::from(byte & 0x0f)]])
        .map(char::from)
        .collect()
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
