//! Script to address extraction.
//!
//! Every output script and input maps to zero or one address string.

use bech32::{segwit, Hrp};
use blkgraph_consensus::ChainParams;

use crate::hash::{hash160, sha256d};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidHrp,
    InvalidProgram,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidHrp => write!(f, "invalid bech32 human readable part"),
            AddressError::InvalidProgram => write!(f, "invalid witness program"),
        }
    }
}

impl std::error::Error for AddressError {}

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;

pub fn script_pubkey_to_address(script: &[u8], params: &ChainParams) -> Option<String> {
    if is_p2pkh(script) {
        return Some(base58_address(params.pubkey_address_prefix, &script[3..23]));
    }
    if is_p2sh(script) {
        return Some(base58_address(params.script_address_prefix, &script[2..22]));
    }
    if let Some((version, program)) = witness_program(script) {
        return match version {
            0 => segwit_address(params, 0, program).ok(),
            1 if program.len() == 32 => segwit_address(params, 1, program).ok(),
            _ => None,
        };
    }
    None
}

/// Address of the key that signed an input, when the input follows one of the
/// standard single-key spending patterns. Coinbase inputs have none.
pub fn input_address(
    script_sig: &[u8],
    witness: &[Vec<u8>],
    params: &ChainParams,
) -> Option<String> {
    if script_sig.is_empty() {
        if witness.len() == 2 && witness[1].len() == 33 && is_pubkey(&witness[1]) {
            return segwit_address(params, 0, &hash160(&witness[1])).ok();
        }
        return None;
    }

    let pushes = parse_pushes(script_sig)?;
    match pushes.as_slice() {
        [_signature, pubkey] if is_pubkey(pubkey) => Some(base58_address(
            params.pubkey_address_prefix,
            &hash160(pubkey),
        )),
        _ => None,
    }
}

fn segwit_address(
    params: &ChainParams,
    version: u8,
    program: &[u8],
) -> Result<String, AddressError> {
    let hrp = Hrp::parse(params.bech32_hrp).map_err(|_| AddressError::InvalidHrp)?;
    let encoded = match version {
        0 => segwit::encode_v0(hrp, program),
        1 => segwit::encode_v1(hrp, program),
        _ => return Err(AddressError::InvalidProgram),
    };
    encoded.map_err(|_| AddressError::InvalidProgram)
}

fn base58_address(prefix: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(prefix);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        op @ OP_1..=0x60 => op - OP_1 + 1,
        _ => return None,
    };
    let len = script[1] as usize;
    if len + 2 != script.len() {
        return None;
    }
    let program = &script[2..];
    if version == 0 && program.len() != 20 && program.len() != 32 {
        return None;
    }
    Some((version, program))
}

fn parse_pushes(script: &[u8]) -> Option<Vec<&[u8]>> {
    let mut pushes = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                usize::try_from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                    .ok()?
            }
            _ => return None,
        };
        let data = script.get(cursor..cursor.checked_add(len)?)?;
        cursor += len;
        pushes.push(data);
    }
    Some(pushes)
}

fn is_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    let checksum = sha256d(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

fn base58_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    if data.is_empty() {
        return String::new();
    }
    let mut digits = vec![0u8];
    for byte in data {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut().rev() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 58) as u8;
            carry = value / 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0u8).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for digit in digits {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkgraph_consensus::{chain_params, Network};

    const KEY_HASH: [u8; 20] = [
        0x75, 0x1e, 0x76, 0xe8, 0x19, 0x91, 0x96, 0xd4, 0x54, 0x94, 0x1c, 0x45, 0xd1, 0xb3,
        0xa3, 0x23, 0xf1, 0x43, 0x3b, 0xd6,
    ];

    fn generator_pubkey() -> Vec<u8> {
        let hex = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex"))
            .collect()
    }

    #[test]
    fn p2pkh_output_address() {
        let params = chain_params(Network::Mainnet);
        let script = p2pkh_script(&KEY_HASH);
        assert_eq!(
            script_pubkey_to_address(&script, &params).as_deref(),
            Some("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")
        );
    }

    #[test]
    fn zero_hash_keeps_leading_ones() {
        let params = chain_params(Network::Mainnet);
        let script = p2pkh_script(&[0u8; 20]);
        assert_eq!(
            script_pubkey_to_address(&script, &params).as_deref(),
            Some("1111111111111111111114oLvT2")
        );
    }

    #[test]
    fn p2wpkh_output_address() {
        let params = chain_params(Network::Mainnet);
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&KEY_HASH);
        assert_eq!(
            script_pubkey_to_address(&script, &params).as_deref(),
            Some("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
        );
    }

    #[test]
    fn non_standard_output_has_no_address() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(script_pubkey_to_address(&[0x6a, 0x01, 0x00], &params), None);
        assert_eq!(script_pubkey_to_address(&[], &params), None);
        // P2PK
        let mut p2pk = vec![0x21];
        p2pk.extend_from_slice(&generator_pubkey());
        p2pk.push(OP_CHECKSIG);
        assert_eq!(script_pubkey_to_address(&p2pk, &params), None);
    }

    #[test]
    fn input_signed_by_key_maps_to_p2pkh() {
        let params = chain_params(Network::Mainnet);
        let pubkey = generator_pubkey();
        assert_eq!(hash160(&pubkey), KEY_HASH);

        let mut script_sig = vec![0x47];
        script_sig.extend_from_slice(&[0x30; 0x47]);
        script_sig.push(0x21);
        script_sig.extend_from_slice(&pubkey);
        assert_eq!(
            input_address(&script_sig, &[], &params).as_deref(),
            Some("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")
        );
    }

    #[test]
    fn witness_input_maps_to_p2wpkh() {
        let params = chain_params(Network::Mainnet);
        let witness = vec![vec![0x30; 71], generator_pubkey()];
        assert_eq!(
            input_address(&[], &witness, &params).as_deref(),
            Some("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
        );
    }

    #[test]
    fn unrecognized_inputs_have_no_address() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(input_address(&[], &[], &params), None);
        assert_eq!(input_address(&[0x04, 0xff, 0xff, 0x00, 0x1d], &[], &params), None);
        // truncated push
        assert_eq!(input_address(&[0x21, 0x02], &[], &params), None);
    }
}
