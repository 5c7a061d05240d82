// Wire codec: the JSON envelope exchanged over every connection, and the
// hand-rolled binary encoding carried inside its base64 `Data` field for the
// two payload-bearing actions (NEWBLOCK, BLOCKCHAINBCAST). See SPEC_FULL.md
// §4.3: Action is a closed enum, not a free-form string, and each variant
// carries its own typed payload rather than a shared "Data" blob.

use data_encoding::BASE64;
use serde_json::Value;

use crate::consensus::chain::ChainSnapshot;
use crate::error::CodecError;
use crate::primitives::block::Block;

/// One message as it travels the wire: `{"Action": <name>, "Data": <payload>}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Ping { port: u16 },
    Pong,
    Ack,
    NewBlock(String),
    GetBlockchain,
    BlockchainBcast(String),
}

impl Envelope {
    fn action_name(&self) -> &'static str {
        match self {
            Envelope::Ping { .. } => "PING",
            Envelope::Pong => "PONG",
            Envelope::Ack => "ACK",
            Envelope::NewBlock(_) => "NEWBLOCK",
            Envelope::GetBlockchain => "GETBLOCKCHAIN",
            Envelope::BlockchainBcast(_) => "BLOCKCHAINBCAST",
        }
    }

    pub fn to_json(&self) -> String {
        let data = match self {
            Envelope::Ping { port } => serde_json::json!({ "port": port }),
            Envelope::Pong | Envelope::Ack | Envelope::GetBlockchain => Value::Null,
            Envelope::NewBlock(b64) | Envelope::BlockchainBcast(b64) => Value::String(b64.clone()),
        };
        serde_json::json!({ "Action": self.action_name(), "Data": data }).to_string()
    }

    pub fn from_json(s: &str) -> Result<Envelope, CodecError> {
        let v: Value = serde_json::from_str(s)?;
        let action = v
            .get("Action")
            .and_then(Value::as_str)
            .ok_or(CodecError::BinaryPayload("envelope missing Action"))?;
        let data = v.get("Data").cloned().unwrap_or(Value::Null);
        match action {
            "PING" => {
                let port = data
                    .get("port")
                    .and_then(Value::as_u64)
                    .ok_or(CodecError::BinaryPayload("PING missing port"))?;
                Ok(Envelope::Ping { port: port as u16 })
            }
            "PONG" => Ok(Envelope::Pong),
            "ACK" => Ok(Envelope::Ack),
            "NEWBLOCK" => {
                let b64 = data
                    .as_str()
                    .ok_or(CodecError::BinaryPayload("NEWBLOCK data is not a string"))?;
                Ok(Envelope::NewBlock(b64.to_string()))
            }
            "GETBLOCKCHAIN" => Ok(Envelope::GetBlockchain),
            "BLOCKCHAINBCAST" => {
                let b64 = data
                    .as_str()
                    .ok_or(CodecError::BinaryPayload("BLOCKCHAINBCAST data is not a string"))?;
                Ok(Envelope::BlockchainBcast(b64.to_string()))
            }
            other => Err(CodecError::UnknownAction(other.to_string())),
        }
    }
}

// --- binary payload encoding -----------------------------------------------
//
// Length-prefixed fields in declaration order, little-endian integers. Not
// bincode: this mirrors the explicit field-by-field encode/decode style the
// rest of this crate's wire format follows, and keeps the layout pinned
// regardless of any derive macro's internal representation.

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < *pos + 4 {
        return Err(CodecError::Eof);
    }
    let len = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if buf.len() < *pos + len {
        return Err(CodecError::Eof);
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn read_str(buf: &[u8], pos: &mut usize) -> Result<String, CodecError> {
    let bytes = read_bytes(buf, pos)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BinaryPayload("field is not valid utf-8"))
}

fn encode_block(buf: &mut Vec<u8>, block: &Block) {
    buf.extend_from_slice(&block.index.to_le_bytes());
    write_str(buf, &block.hash);
    write_str(buf, &block.previous_hash);
    buf.extend_from_slice(&block.timestamp.to_le_bytes());
    write_bytes(buf, &block.data);
    buf.extend_from_slice(&(block.difficulty as u64).to_le_bytes());
    write_str(buf, &block.nonce);
}

fn decode_block(buf: &[u8], pos: &mut usize) -> Result<Block, CodecError> {
    if buf.len() < *pos + 8 {
        return Err(CodecError::Eof);
    }
    let index = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    let hash = read_str(buf, pos)?;
    let previous_hash = read_str(buf, pos)?;
    if buf.len() < *pos + 8 {
        return Err(CodecError::Eof);
    }
    let timestamp = i64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    let data = read_bytes(buf, pos)?.to_vec();
    if buf.len() < *pos + 8 {
        return Err(CodecError::Eof);
    }
    let difficulty = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap()) as u32;
    *pos += 8;
    let nonce = read_str(buf, pos)?;
    Ok(Block {
        index,
        previous_hash,
        timestamp,
        data,
        difficulty,
        nonce,
        hash,
    })
}

/// Encodes a single block as base64(binary), for a NEWBLOCK envelope.
pub fn encode_block_b64(block: &Block) -> String {
    let mut buf = Vec::new();
    encode_block(&mut buf, block);
    BASE64.encode(&buf)
}

/// Decodes the base64(binary) payload of a NEWBLOCK envelope.
pub fn decode_block_b64(b64: &str) -> Result<Block, CodecError> {
    let buf = BASE64
        .decode(b64.as_bytes())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    let mut pos = 0;
    decode_block(&buf, &mut pos)
}

/// Encodes a whole chain snapshot: block count, blocks in order, then the
/// two difficulty counters, for a BLOCKCHAINBCAST envelope.
pub fn encode_chain_b64(snapshot: &ChainSnapshot) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(snapshot.blocks.len() as u32).to_le_bytes());
    for block in &snapshot.blocks {
        encode_block(&mut buf, block);
    }
    buf.extend_from_slice(&snapshot.cumulative_difficulty.to_le_bytes());
    buf.extend_from_slice(&(snapshot.current_difficulty as u64).to_le_bytes());
    BASE64.encode(&buf)
}

/// Decodes the base64(binary) payload of a BLOCKCHAINBCAST envelope.
pub fn decode_chain_b64(b64: &str) -> Result<ChainSnapshot, CodecError> {
    let buf = BASE64
        .decode(b64.as_bytes())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    let mut pos = 0;
    if buf.len() < 4 {
        return Err(CodecError::Eof);
    }
    let count = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(decode_block(&buf, &mut pos)?);
    }
    if buf.len() < pos + 16 {
        return Err(CodecError::Eof);
    }
    let cumulative_difficulty = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let current_difficulty = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()) as u32;
    Ok(ChainSnapshot::new(blocks, cumulative_difficulty, current_difficulty))
}
