// Segment decryption: AES-128-CBC with playlist or sequence-derived IVs.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};

use crate::error::DecryptionError;
use crate::model::CryptoContext;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;

/// IV for a segment without an explicit one: 12 zero bytes followed by the
/// big-endian segment index.
pub fn derive_iv(segment_index: usize) -> Result<[u8; 16], DecryptionError> {
    let sequence =
        u32::try_from(segment_index).map_err(|_| DecryptionError::IndexOutOfRange(segment_index))?;
    let mut iv = [0u8; 16];
    iv[12..].copy_from_slice(&sequence.to_be_bytes());
    Ok(iv)
}

/// Decode a hex IV, accepting the `0x` prefix used in `#EXT-X-KEY` tags.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16], DecryptionError> {
    let trimmed = iv_hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let bytes = hex::decode(digits).map_err(|source| DecryptionError::InvalidIv {
        iv: iv_hex.to_string(),
        source,
    })?;

    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecryptionError::InvalidIvLength(bytes.len()))
}

/// Decrypt one segment. Output length equals input length: any padding is
/// left in place for the container format to interpret.
pub fn decrypt_segment(
    ciphertext: &[u8],
    key: &[u8],
    iv_hex: Option<&str>,
    segment_index: usize,
) -> Result<Vec<u8>, DecryptionError> {
    if key.len() != KEY_SIZE {
        return Err(DecryptionError::InvalidKeyLength(key.len()));
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(DecryptionError::Misaligned(ciphertext.len()));
    }

    let iv = match iv_hex {
        Some(iv_hex) => parse_iv(iv_hex)?,
        None => derive_iv(segment_index)?,
    };

    let cipher = Aes128CbcDec::new_from_slices(key, &iv)
        .map_err(|_| DecryptionError::InvalidKeyLength(key.len()))?;

    let mut buffer = ciphertext.to_vec();
    let plain_len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| DecryptionError::Misaligned(ciphertext.len()))?
        .len();
    buffer.truncate(plain_len);
    Ok(buffer)
}

/// Offloads CPU-intensive decryption to the blocking thread pool.
#[derive(Debug, Clone)]
pub struct DecryptionOffloader {
    enabled: bool,
}

impl DecryptionOffloader {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decrypt a segment under `crypto`, optionally on the blocking pool.
    pub async fn decrypt(
        &self,
        data: Bytes,
        crypto: &CryptoContext,
        segment_index: usize,
    ) -> Result<Bytes, DecryptionError> {
        if self.enabled {
            let key = crypto.key.clone();
            let iv_hex = crypto.iv_hex.clone();
            tokio::task::spawn_blocking(move || {
                decrypt_segment(&data, &key, iv_hex.as_deref(), segment_index).map(Bytes::from)
            })
            .await
            .map_err(|e| DecryptionError::Offload(e.to_string()))?
        } else {
            decrypt_segment(&data, &crypto.key, crypto.iv_hex.as_deref(), segment_index)
                .map(Bytes::from)
        }
    }
}
