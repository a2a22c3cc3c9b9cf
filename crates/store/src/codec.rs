//! Page blob codec.
//!
//! ```text
//! write: Page ─serialize─▶ payload ─zstd─▶ compressed ─[+crc32]─▶ checked ─[encrypt]─▶ blob
//! read:  blob ─[decrypt]─▶ checked ─[verify crc32]─▶ compressed ─unzstd─▶ payload ─▶ Page
//! ```
//!
//! The CRC32 covers the compressed bytes and is appended to them; the same value
//! is returned to the caller for the parent's [`PageLocation`]. On read both the
//! recorded and the trailing checksum must match. Encryption uses
//! XChaCha20-Poly1305 with a fresh random 24-byte nonce prepended to each blob.

use byteorder::{ByteOrder, LittleEndian};
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};

use crate::{
    config::{ENCRYPTION_KEY_SIZE, StoreConfig},
    error::{Error, Result},
    page::{Page, PageLocation},
};

/// Size of the trailing CRC32.
const CHECKSUM_SIZE: usize = 4;

/// XChaCha20 nonce size.
const NONCE_SIZE: usize = 24;

/// An encoded page ready to append.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    /// Blob bytes as written to the file.
    pub bytes: Vec<u8>,
    /// CRC32 of the compressed payload, or 0 when unchecked.
    pub checksum: u32,
}

/// Symmetric page encryption.
#[derive(Clone)]
pub struct PageCipher {
    cipher: XChaCha20Poly1305,
}

impl PageCipher {
    /// Creates a cipher from a 32-byte key.
    pub fn new(key: &[u8; ENCRYPTION_KEY_SIZE]) -> Self {
        Self { cipher: XChaCha20Poly1305::new(Key::from_slice(key)) }
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encrypt`] if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext).map_err(|_| Error::Encrypt)?;
        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a `nonce || ciphertext` blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] on a short blob, a wrong key or tampered bytes.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_SIZE {
            return Err(Error::Decrypt);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| Error::Decrypt)
    }
}

impl std::fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PageCipher(..)")
    }
}

/// Encodes and decodes page blobs for one store.
#[derive(Debug, Clone)]
pub struct PageCodec {
    compression_level: i32,
    checksummed: bool,
    cipher: Option<PageCipher>,
}

impl PageCodec {
    /// Creates a codec with explicit storage properties.
    pub fn new(compression_level: i32, checksummed: bool, cipher: Option<PageCipher>) -> Self {
        Self { compression_level, checksummed, cipher }
    }

    /// Creates a codec for a new store from its configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.compression_level,
            config.checksummed,
            config.encryption_key.as_ref().map(PageCipher::new),
        )
    }

    /// Whether blobs carry a CRC32.
    pub fn is_checksummed(&self) -> bool {
        self.checksummed
    }

    /// Whether blobs are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encodes a page into a blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UncommittedReference`] if the page still points at logged
    /// children, [`Error::Compress`] or [`Error::Encrypt`] if a stage fails.
    pub fn encode(&self, page: &Page) -> Result<EncodedPage> {
        let payload = page.serialize()?;
        let mut bytes = zstd::encode_all(payload.as_slice(), self.compression_level)
            .map_err(|source| Error::Compress { source })?;

        let checksum = if self.checksummed {
            let checksum = crc32fast::hash(&bytes);
            bytes.extend_from_slice(&checksum.to_le_bytes());
            checksum
        } else {
            0
        };

        if let Some(cipher) = &self.cipher {
            bytes = cipher.encrypt(&bytes)?;
        }
        Ok(EncodedPage { bytes, checksum })
    }

    /// Decodes the blob stored at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`], [`Error::ChecksumMismatch`],
    /// [`Error::Decompress`] or [`Error::Corrupted`] from the failing stage.
    pub fn decode(&self, blob: &[u8], location: &PageLocation) -> Result<Page> {
        let decrypted;
        let mut bytes = blob;
        if let Some(cipher) = &self.cipher {
            decrypted = cipher.decrypt(blob)?;
            bytes = &decrypted;
        }

        if self.checksummed {
            if bytes.len() < CHECKSUM_SIZE {
                return Err(Error::Corrupted {
                    reason: format!("page blob at {} shorter than its checksum", location.offset),
                });
            }
            let (compressed, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
            let stored = LittleEndian::read_u32(trailer);
            let actual = crc32fast::hash(compressed);
            if actual != location.checksum || stored != location.checksum {
                return Err(Error::ChecksumMismatch {
                    offset: location.offset,
                    expected: location.checksum,
                    actual,
                });
            }
            bytes = compressed;
        }

        let payload = zstd::decode_all(bytes).map_err(|source| Error::Decompress { source })?;
        Page::deserialize(&payload)
    }
}
