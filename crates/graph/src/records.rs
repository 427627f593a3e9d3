//! Vertex payloads. Each record is prefixed with a one-byte layout version.

use blkgraph_consensus::Hash256;
use blkgraph_primitives::encoding::{DecodeError, Decoder, Encoder};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::schema::{UniqueIndex, VertexType};

const RECORD_VERSION: u8 = 1;

pub trait VertexRecord: Sized + Send + 'static {
    const KIND: VertexType;

    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, GraphError>;

    /// The unique index entry this record owns, if any.
    fn unique_key(&self) -> Option<(UniqueIndex, Vec<u8>)> {
        None
    }
}

fn begin() -> Encoder {
    let mut encoder = Encoder::new();
    encoder.write_u8(RECORD_VERSION);
    encoder
}

fn open(bytes: &[u8]) -> Result<Decoder<'_>, GraphError> {
    let mut decoder = Decoder::new(bytes);
    let version = decoder.read_u8()?;
    if version != RECORD_VERSION {
        return Err(GraphError::Corrupt("unknown record version"));
    }
    Ok(decoder)
}

fn finish<T>(decoder: Decoder<'_>, value: T) -> Result<T, GraphError> {
    if !decoder.is_empty() {
        return Err(GraphError::Decode(DecodeError::TrailingBytes));
    }
    Ok(value)
}

fn write_opt_str(encoder: &mut Encoder, value: Option<&str>) {
    match value {
        Some(value) => {
            encoder.write_bool(true);
            encoder.write_var_str(value);
        }
        None => encoder.write_bool(false),
    }
}

fn read_opt_str(decoder: &mut Decoder<'_>) -> Result<Option<String>, DecodeError> {
    if decoder.read_bool()? {
        Ok(Some(decoder.read_var_str()?))
    } else {
        Ok(None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub difficulty_target: u32,
    pub nonce: u32,
    pub version: i32,
    pub tx_count: u32,
    pub origin_file: String,
    pub origin_file_offset: u64,
    pub fully_parsed: bool,
}

impl VertexRecord for BlockRecord {
    const KIND: VertexType = VertexType::Block;

    fn encode(&self) -> Vec<u8> {
        let mut encoder = begin();
        encoder.write_hash_le(&self.hash);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.difficulty_target);
        encoder.write_u32_le(self.nonce);
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.tx_count);
        encoder.write_var_str(&self.origin_file);
        encoder.write_u64_le(self.origin_file_offset);
        encoder.write_bool(self.fully_parsed);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut decoder = open(bytes)?;
        let record = Self {
            hash: decoder.read_hash_le()?,
            prev_hash: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            difficulty_target: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
            version: decoder.read_i32_le()?,
            tx_count: decoder.read_u32_le()?,
            origin_file: decoder.read_var_str()?,
            origin_file_offset: decoder.read_u64_le()?,
            fully_parsed: decoder.read_bool()?,
        };
        finish(decoder, record)
    }

    fn unique_key(&self) -> Option<(UniqueIndex, Vec<u8>)> {
        Some((UniqueIndex::BlockHash, self.hash.to_vec()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub txid: Hash256,
    pub wtxid: Hash256,
    pub version: i32,
    pub lock_time: u32,
    pub coinbase: bool,
    pub input_count: u32,
    pub output_count: u32,
    /// Absolute byte offset of the transaction inside its block file.
    pub origin_file_offset: u64,
}

impl VertexRecord for TransactionRecord {
    const KIND: VertexType = VertexType::Transaction;

    fn encode(&self) -> Vec<u8> {
        let mut encoder = begin();
        encoder.write_hash_le(&self.txid);
        encoder.write_hash_le(&self.wtxid);
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.lock_time);
        encoder.write_bool(self.coinbase);
        encoder.write_u32_le(self.input_count);
        encoder.write_u32_le(self.output_count);
        encoder.write_u64_le(self.origin_file_offset);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut decoder = open(bytes)?;
        let record = Self {
            txid: decoder.read_hash_le()?,
            wtxid: decoder.read_hash_le()?,
            version: decoder.read_i32_le()?,
            lock_time: decoder.read_u32_le()?,
            coinbase: decoder.read_bool()?,
            input_count: decoder.read_u32_le()?,
            output_count: decoder.read_u32_le()?,
            origin_file_offset: decoder.read_u64_le()?,
        };
        finish(decoder, record)
    }

    fn unique_key(&self) -> Option<(UniqueIndex, Vec<u8>)> {
        Some((UniqueIndex::TransactionId, self.txid.to_vec()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRecord {
    pub index: u32,
    pub prev_txid: Hash256,
    pub prev_index: u32,
    pub sequence: u32,
    pub coinbase: bool,
    /// Spent amount. Block files do not carry it, so it stays 0 until the
    /// previous output is resolved.
    pub value: i64,
    pub source_offset: u64,
    /// Set only when addresses are stored as attributes.
    pub address: Option<String>,
}

impl VertexRecord for InputRecord {
    const KIND: VertexType = VertexType::InputTx;

    fn encode(&self) -> Vec<u8> {
        let mut encoder = begin();
        encoder.write_u32_le(self.index);
        encoder.write_hash_le(&self.prev_txid);
        encoder.write_u32_le(self.prev_index);
        encoder.write_u32_le(self.sequence);
        encoder.write_bool(self.coinbase);
        encoder.write_i64_le(self.value);
        encoder.write_u64_le(self.source_offset);
        write_opt_str(&mut encoder, self.address.as_deref());
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut decoder = open(bytes)?;
        let record = Self {
            index: decoder.read_u32_le()?,
            prev_txid: decoder.read_hash_le()?,
            prev_index: decoder.read_u32_le()?,
            sequence: decoder.read_u32_le()?,
            coinbase: decoder.read_bool()?,
            value: decoder.read_i64_le()?,
            source_offset: decoder.read_u64_le()?,
            address: read_opt_str(&mut decoder)?,
        };
        finish(decoder, record)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
    pub index: u32,
    pub value: i64,
    pub source_offset: u64,
    /// Set only when addresses are stored as attributes.
    pub address: Option<String>,
}

impl VertexRecord for OutputRecord {
    const KIND: VertexType = VertexType::OutputTx;

    fn encode(&self) -> Vec<u8> {
        let mut encoder = begin();
        encoder.write_u32_le(self.index);
        encoder.write_i64_le(self.value);
        encoder.write_u64_le(self.source_offset);
        write_opt_str(&mut encoder, self.address.as_deref());
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut decoder = open(bytes)?;
        let record = Self {
            index: decoder.read_u32_le()?,
            value: decoder.read_i64_le()?,
            source_offset: decoder.read_u64_le()?,
            address: read_opt_str(&mut decoder)?,
        };
        finish(decoder, record)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRecord {
    pub hash: String,
}

impl VertexRecord for AddressRecord {
    const KIND: VertexType = VertexType::Address;

    fn encode(&self) -> Vec<u8> {
        let mut encoder = begin();
        encoder.write_var_str(&self.hash);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        let mut decoder = open(bytes)?;
        let record = Self {
            hash: decoder.read_var_str()?,
        };
        finish(decoder, record)
    }

    fn unique_key(&self) -> Option<(UniqueIndex, Vec<u8>)> {
        Some((UniqueIndex::AddressHash, self.hash.as_bytes().to_vec()))
    }
}

/// Summary of one importer invocation, stored as JSON after the version byte.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    pub kind: String,
    pub status: String,
    /// Unix milliseconds.
    pub begin_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<u64>,
    pub parsed_blocks: u64,
    pub parsed_transactions: u64,
    pub new_addresses: u64,
    pub new_blocks: u64,
    pub new_transactions: u64,
    pub new_transaction_inputs: u64,
    pub new_transaction_outputs: u64,
    pub address_edges: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub linked_blocks: u64,
    pub skipped_blocks: u64,
    pub hash_not_found: u64,
}

impl ImportRecord {
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
    }
}

impl VertexRecord for ImportRecord {
    const KIND: VertexType = VertexType::Import;

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![RECORD_VERSION];
        // Serializing a plain struct of strings and integers cannot fail.
        if let Ok(json) = serde_json::to_vec(self) {
            out.extend_from_slice(&json);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, GraphError> {
        match bytes.split_first() {
            Some((&RECORD_VERSION, json)) => serde_json::from_slice::<Self>(json)
                .map_err(|_| GraphError::Corrupt("invalid import record json")),
            _ => Err(GraphError::Corrupt("unknown record version")),
        }
    }
}
