//! Transaction types and serialization.
//!
//! Decoded transactions, inputs and outputs carry the byte offset at which
//! they start inside the buffer they were decoded from, so callers can record
//! provenance without re-parsing.

use blkgraph_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

/// The output an input spends.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    /// Spent by coinbase inputs.
    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
    pub offset: u32,
}

impl TxIn {
    pub fn is_coinbase(&self) -> bool {
        self.prevout.is_null()
    }

    fn encode_base(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.prevout.hash);
        encoder.write_u32_le(self.prevout.index);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn decode_base(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let offset = offset_of(decoder)?;
        let prevout = OutPoint {
            hash: decoder.read_hash_le()?,
            index: decoder.read_u32_le()?,
        };
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
            offset,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub offset: u32,
}

impl TxOut {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let offset = offset_of(decoder)?;
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
            offset,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    pub offset: u32,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Legacy serialization without witness data.
    pub fn encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, false);
        encoder.into_inner()
    }

    /// Full serialization, using the segwit layout when any input has a witness.
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, self.has_witness());
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_without_witness())
    }

    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn encode_into(&self, encoder: &mut Encoder, with_witness: bool) {
        encoder.write_i32_le(self.version);
        if with_witness {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_base(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(encoder);
        }
        if with_witness {
            for input in &self.inputs {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(TransactionDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let offset = offset_of(decoder)?;
        let version = decoder.read_i32_le()?;

        let mut input_count = decoder.read_varint()?;
        let mut segwit = false;
        if input_count == 0 {
            let flag = decoder.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(TransactionDecodeError::InvalidTransactionFormat(
                    "unknown segwit flag",
                ));
            }
            segwit = true;
            input_count = decoder.read_varint()?;
        }

        let mut inputs = Vec::with_capacity(bounded_capacity(input_count, decoder));
        for _ in 0..input_count {
            inputs.push(TxIn::decode_base(decoder)?);
        }

        let output_count = decoder.read_varint()?;
        let mut outputs = Vec::with_capacity(bounded_capacity(output_count, decoder));
        for _ in 0..output_count {
            outputs.push(TxOut::decode(decoder)?);
        }

        if segwit {
            for input in inputs.iter_mut() {
                let items = decoder.read_varint()?;
                let mut witness = Vec::with_capacity(bounded_capacity(items, decoder));
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
            if inputs.iter().all(|input| input.witness.is_empty()) {
                return Err(TransactionDecodeError::InvalidTransactionFormat(
                    "superfluous witness record",
                ));
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
            offset,
        })
    }
}

fn offset_of(decoder: &Decoder) -> Result<u32, DecodeError> {
    u32::try_from(decoder.position()).map_err(|_| DecodeError::SizeTooLarge)
}

// Every item takes at least one byte, so the remaining input bounds the count.
fn bounded_capacity(count: u64, decoder: &Decoder) -> usize {
    usize::try_from(count)
        .unwrap_or(usize::MAX)
        .min(decoder.remaining())
}

#[derive(Debug)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    InvalidTransactionFormat(&'static str),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(error: DecodeError) -> Self {
        TransactionDecodeError::Decode(error)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(error) => write!(f, "{error}"),
            TransactionDecodeError::InvalidTransactionFormat(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for TransactionDecodeError {}
