//! Control messages exchanged between file servers
//!
//! Messages travel as the payload of a MESSAGE frame. The envelope is a
//! closed enum encoded with bincode; the variant index on the wire is the
//! declaration order below, so new variants must only be appended.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(bincode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(bincode::Error),

    #[error("Encoded message is {len} bytes, maximum is {max}")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The sender is about to push `size` bytes of ciphertext for `key`
    StoreFile(StoreFile),
    /// The sender wants the blob stored under `key`
    GetFile(GetFile),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFile {
    pub key: String,
    /// Ciphertext length, IV included
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFile {
    pub key: String,
}

impl Message {
    pub fn store_file(key: impl Into<String>, size: u64) -> Self {
        Message::StoreFile(StoreFile {
            key: key.into(),
            size,
        })
    }

    pub fn get_file(key: impl Into<String>) -> Self {
        Message::GetFile(GetFile { key: key.into() })
    }

    /// Key the message refers to
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile(m) => &m.key,
            Message::GetFile(m) => &m.key,
        }
    }

    /// Encode, refusing anything that would not fit in one frame
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>, MessageError> {
        let bytes = bincode::serialize(self).map_err(MessageError::Encode)?;
        if bytes.len() > max_size {
            return Err(MessageError::TooLarge {
                len: bytes.len(),
                max: max_size,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(MessageError::Decode)
    }
}
