//! Adapter from a frame payload to the flat record the load pass consumes.

use blkgraph_consensus::{ChainParams, Hash256};
use blkgraph_primitives::{input_address, script_pubkey_to_address, Block, BlockDecodeError, BlockHeader};

/// Decodes one frame payload. Implementations must be deterministic and
/// free of side effects; a failure only skips the frame.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<DecodedBlock, BlockDecodeError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedBlock {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub size: u32,
    pub transactions: Vec<DecodedTransaction>,
}

/// All `offset` fields are relative to the start of the frame payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedTransaction {
    pub txid: Hash256,
    pub wtxid: Hash256,
    pub version: i32,
    pub lock_time: u32,
    pub coinbase: bool,
    pub offset: u32,
    pub inputs: Vec<DecodedInput>,
    pub outputs: Vec<DecodedOutput>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInput {
    pub index: u32,
    pub prev_txid: Hash256,
    pub prev_index: u32,
    pub sequence: u32,
    pub coinbase: bool,
    pub offset: u32,
    pub address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedOutput {
    pub index: u32,
    pub value: i64,
    pub offset: u32,
    pub address: Option<String>,
}

/// Bitcoin-format blocks, addresses rendered for one network.
#[derive(Clone, Debug)]
pub struct BitcoinDecoder {
    params: ChainParams,
}

impl BitcoinDecoder {
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn convert(&self, block: Block, size: u32) -> DecodedBlock {
        let hash = block.header.hash();
        let transactions = block
            .transactions
            .iter()
            .map(|tx| {
                let coinbase = tx.is_coinbase();
                let inputs = tx
                    .inputs
                    .iter()
                    .enumerate()
                    .map(|(index, input)| DecodedInput {
                        index: index as u32,
                        prev_txid: input.prevout.hash,
                        prev_index: input.prevout.index,
                        sequence: input.sequence,
                        coinbase,
                        offset: input.offset,
                        address: if coinbase {
                            None
                        } else {
                            input_address(&input.script_sig, &input.witness, &self.params)
                        },
                    })
                    .collect();
                let outputs = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(index, output)| DecodedOutput {
                        index: index as u32,
                        value: output.value,
                        offset: output.offset,
                        address: script_pubkey_to_address(&output.script_pubkey, &self.params),
                    })
                    .collect();
                DecodedTransaction {
                    txid: tx.txid(),
                    wtxid: tx.wtxid(),
                    version: tx.version,
                    lock_time: tx.lock_time,
                    coinbase,
                    offset: tx.offset,
                    inputs,
                    outputs,
                }
            })
            .collect();
        DecodedBlock {
            hash,
            header: block.header,
            size,
            transactions,
        }
    }
}

impl RecordDecoder for BitcoinDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedBlock, BlockDecodeError> {
        let block = Block::consensus_decode(payload)?;
        Ok(self.convert(block, payload.len() as u32))
    }
}

/// Header of a frame from the first bytes of its payload, if they parse.
pub fn peek_header(head: &[u8]) -> Option<BlockHeader> {
    let bytes = head.get(..blkgraph_primitives::HEADER_SIZE)?;
    BlockHeader::consensus_decode(bytes).ok()
}

/// File position of something at `inner` bytes into the payload of the frame
/// whose length field sits at `frame_offset`.
pub fn absolute_offset(frame_offset: u64, inner: u32) -> u64 {
    frame_offset + 4 + u64::from(inner)
}
