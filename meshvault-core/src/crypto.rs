//! Streaming AES-256-CTR codec for bytes on the wire
//!
//! Every encrypted stream starts with a random 16-byte IV in the clear,
//! followed by the counter-mode ciphertext of the payload. Data is processed
//! in bounded chunks so large files never have to be buffered whole.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// IV length, equal to the AES block size
pub const IV_SIZE: usize = 16;

/// Key length for AES-256
pub const KEY_SIZE: usize = 32;

/// Chunk size used when streaming through the cipher
pub const CHUNK_SIZE: usize = 32 * 1024;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Ciphertext too short: expected at least {IV_SIZE} bytes of IV, got {0}")]
    ShortInput(usize),

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric key shared by every node of a mesh
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Parse a key from 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            CipherError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, b.len()))
        })?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Never print key material
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Counter-mode keystream bound to one key and IV
///
/// Used directly when a single encryption pass has to be fanned out to
/// several writers, so every destination sees the same IV and ciphertext.
pub struct Keystream {
    cipher: Aes256Ctr,
}

impl Keystream {
    pub fn new(key: &EncryptionKey, iv: &[u8; IV_SIZE]) -> Result<Self, CipherError> {
        let cipher = Aes256Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// XOR the keystream into `buf` in place (encrypts or decrypts)
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// Generate a random IV
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt `src` into `dst`, prefixing a fresh random IV
///
/// Returns the total number of bytes written, including the IV.
pub async fn copy_encrypt<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv = random_iv();
    let mut stream = Keystream::new(key, &iv)?;

    dst.write_all(&iv).await?;
    let written = copy_stream(&mut stream, src, dst).await?;
    dst.flush().await?;

    Ok(written + IV_SIZE as u64)
}

/// Decrypt an IV-prefixed stream from `src` into `dst`
///
/// Returns the number of plaintext bytes written.
pub async fn copy_decrypt<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    let mut filled = 0;
    while filled < IV_SIZE {
        match src.read(&mut iv[filled..]).await? {
            0 => return Err(CipherError::ShortInput(filled)),
            n => filled += n,
        }
    }

    let mut stream = Keystream::new(key, &iv)?;
    let written = copy_stream(&mut stream, src, dst).await?;
    dst.flush().await?;

    Ok(written)
}

async fn copy_stream<R, W>(
    stream: &mut Keystream,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.apply(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    Ok(total)
}
