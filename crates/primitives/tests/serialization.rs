use blkgraph_consensus::{chain_params, hash256_to_hex, Network, GENESIS_PREV_HASH};
use blkgraph_primitives::block::{Block, BlockDecodeError, BlockHeader, HEADER_SIZE};
use blkgraph_primitives::encoding::DecodeError;
use blkgraph_primitives::transaction::{OutPoint, Transaction, TxIn, TxOut};
use blkgraph_primitives::{input_address, p2pkh_script, script_pubkey_to_address};

const GENESIS_BLOCK_HEX: &str = concat!(
    "0100000000000000000000000000000000000000000000000000000000000000",
    "000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa",
    "4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100000000000000000000",
    "00000000000000000000000000000000000000000000ffffffff4d04ffff001d",
    "0104455468652054696d65732030332f4a616e2f32303039204368616e63656c",
    "6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f75742066",
    "6f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe554827",
    "1967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4",
    "f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000",
);

fn from_hex(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex"))
        .collect()
}

#[test]
fn decode_genesis_block() {
    let bytes = from_hex(GENESIS_BLOCK_HEX);
    assert_eq!(bytes.len(), 285);

    let block = Block::consensus_decode(&bytes).expect("decode genesis");
    assert_eq!(block.header.prev_block, GENESIS_PREV_HASH);
    assert_eq!(block.header.time, 1_231_006_505);
    assert_eq!(block.header.bits, 0x1d00_ffff);
    assert_eq!(block.header.nonce, 2_083_236_893);
    assert_eq!(
        hash256_to_hex(&block.header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );

    assert_eq!(block.transactions.len(), 1);
    let tx = &block.transactions[0];
    assert!(tx.is_coinbase());
    assert_eq!(
        hash256_to_hex(&tx.txid()),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
    assert_eq!(tx.txid(), block.header.merkle_root);
    assert_eq!(tx.offset as usize, HEADER_SIZE + 1);
    assert_eq!(tx.inputs[0].offset, 86);
    assert_eq!(tx.outputs[0].offset, 205);
    assert_eq!(tx.outputs[0].value, 5_000_000_000);

    // P2PK outputs carry no address.
    let params = chain_params(Network::Mainnet);
    assert_eq!(
        script_pubkey_to_address(&tx.outputs[0].script_pubkey, &params),
        None
    );
    assert_eq!(
        input_address(&tx.inputs[0].script_sig, &tx.inputs[0].witness, &params),
        None
    );

    assert_eq!(block.consensus_encode(), bytes);
}

#[test]
fn header_roundtrip_is_eighty_bytes() {
    let header = BlockHeader {
        version: 0x2000_0000,
        prev_block: [0x11; 32],
        merkle_root: [0x22; 32],
        time: 200,
        bits: 0x207f_ffff,
        nonce: 42,
    };
    let encoded = header.consensus_encode();
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(BlockHeader::consensus_decode(&encoded).expect("header"), header);
}

#[test]
fn block_with_segwit_transaction_keeps_offsets() {
    let spend = Transaction {
        version: 2,
        inputs: vec![TxIn {
            prevout: OutPoint {
                hash: [0x33; 32],
                index: 0,
            },
            script_sig: Vec::new(),
            sequence: u32::MAX,
            witness: vec![vec![0x30; 72], vec![0x02; 33]],
            offset: 0,
        }],
        outputs: vec![TxOut {
            value: 1_000,
            script_pubkey: p2pkh_script(&[0x44; 20]),
            offset: 0,
        }],
        lock_time: 0,
        offset: 0,
    };
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, 0x01],
            sequence: u32::MAX,
            witness: Vec::new(),
            offset: 0,
        }],
        outputs: vec![TxOut {
            value: 50,
            script_pubkey: p2pkh_script(&[0x55; 20]),
            offset: 0,
        }],
        lock_time: 0,
        offset: 0,
    };
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0x01; 32],
            merkle_root: [0x02; 32],
            time: 1,
            bits: 2,
            nonce: 3,
        },
        transactions: vec![coinbase.clone(), spend.clone()],
    };
    let bytes = block.consensus_encode();
    let decoded = Block::consensus_decode(&bytes).expect("decode");

    let coinbase_len = coinbase.consensus_encode().len() as u32;
    assert_eq!(decoded.transactions[0].offset, 81);
    assert_eq!(decoded.transactions[1].offset, 81 + coinbase_len);
    assert_eq!(
        decoded.transactions[1].inputs[0].offset,
        81 + coinbase_len + 7
    );
    assert_eq!(decoded.transactions[1].inputs[0].witness, spend.inputs[0].witness);
    assert_eq!(decoded.transactions[1].txid(), spend.txid());
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = from_hex(GENESIS_BLOCK_HEX);
    bytes.push(0);
    assert!(matches!(
        Block::consensus_decode(&bytes),
        Err(BlockDecodeError::Decode(DecodeError::TrailingBytes))
    ));
}

#[test]
fn empty_block_is_rejected() {
    let mut bytes = from_hex(GENESIS_BLOCK_HEX)[..HEADER_SIZE].to_vec();
    bytes.push(0);
    assert!(matches!(
        Block::consensus_decode(&bytes),
        Err(BlockDecodeError::NoTransactions)
    ));
}
