//! Protocol messages for rota peer communication.
//!
//! Defines message types for:
//! - Handshake (Version, Verack)
//! - Inventory gossip (advertise, request, deliver, not found)
//! - Payloads (transactions, blocks, meeting messages)
//! - Keep-alive (Ping, Pong)

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use rota_consensus::MeetingMessage;
use rota_core::{Block, BlockHash, Hash, Transaction, TxId};

/// Protocol version for compatibility checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Major versions must match.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What an inventory hash refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    /// A freshly produced block, delivered as [`Message::NewBlock`].
    NewBlock,
    /// Any stored block, delivered as [`Message::Block`].
    Block,
    Transaction,
    /// A cached meeting message.
    Consensus,
}

/// A `(kind, hash)` advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn new_block(hash: BlockHash) -> Self {
        Self {
            kind: InventoryKind::NewBlock,
            hash: hash.0,
        }
    }

    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InventoryKind::Block,
            hash: hash.0,
        }
    }

    pub fn transaction(id: TxId) -> Self {
        Self {
            kind: InventoryKind::Transaction,
            hash: id.0,
        }
    }

    pub fn consensus(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Consensus,
            hash,
        }
    }
}

/// Opening handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: ProtocolVersion,
    pub chain_id: String,
    pub best_height: u64,
    pub best_hash: BlockHash,
    /// Sender's network time in unix millis.
    pub timestamp: i64,
}

/// Handshake acknowledgement; its timestamp sets the clock offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerackMessage {
    pub best_height: u64,
    pub best_hash: BlockHash,
    pub timestamp: i64,
}

/// Network message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // === Handshake ===
    Version(VersionMessage),
    Verack(VerackMessage),

    // === Inventory ===
    /// Advertise available objects.
    Inventory(Vec<InventoryItem>),
    /// Request advertised objects.
    GetData(Vec<InventoryItem>),
    /// Requested objects the sender does not have.
    NotFound(Vec<InventoryItem>),

    // === Payloads ===
    Transaction(Transaction),
    NewBlock(Block),
    Block(Block),
    Consensus(MeetingMessage),

    // === Keep-alive ===
    Ping(u64),
    Pong(u64),
}

impl Message {
    /// Get the message type as a string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::Verack(_) => "Verack",
            Message::Inventory(_) => "Inventory",
            Message::GetData(_) => "GetData",
            Message::NotFound(_) => "NotFound",
            Message::Transaction(_) => "Transaction",
            Message::NewBlock(_) => "NewBlock",
            Message::Block(_) => "Block",
            Message::Consensus(_) => "Consensus",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }

    /// Check if this is a request message (expects a response).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Version(_) | Message::GetData(_) | Message::Ping(_)
        )
    }
}

/// Length-prefixed bincode framing.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
}

impl MessageCodec {
    /// Default maximum message size (16 MB).
    pub const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_size: Self::DEFAULT_MAX_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Encode a message to a frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(message)?;

        if payload.len() > self.max_size {
            return Err(CodecError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }

        // Frame format: [length: 4 bytes][payload]
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        Ok(frame)
    }

    /// Decode a message from a complete frame.
    pub fn decode(&self, data: &[u8]) -> Result<Message, CodecError> {
        if data.len() < 4 {
            return Err(CodecError::IncompleteFrame);
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        self.check_length(length)?;

        if data.len() < 4 + length {
            return Err(CodecError::IncompleteFrame);
        }

        Ok(bincode::deserialize(&data[4..4 + length])?)
    }

    fn check_length(&self, length: usize) -> Result<(), CodecError> {
        if length > self.max_size {
            return Err(CodecError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Read one framed message from an async stream.
    pub async fn read_frame<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message, CodecError> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf) as usize;
        self.check_length(length)?;

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Ok(bincode::deserialize(&payload)?)
    }

    /// Write one framed message to an async stream.
    pub async fn write_frame<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        message: &Message,
    ) -> Result<(), CodecError> {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message too large: {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("incomplete frame")]
    IncompleteFrame,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
