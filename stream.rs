//! Chunked streaming encryption and decryption for large files.
//!
//! This module provides [`StreamCipher`] for processing files of any size in
//! independently authenticated chunks, without loading them into memory.
//!
//! ## Wire Format
//!
//! ```text
//! [chunk0][chunk1]...[chunkN]
//!
//! Each chunk:
//! [nonce:12][ciphertext][tag:16]
//! ```
//!
//! Every chunk carries exactly 64 KiB of plaintext except the last, which may
//! be shorter. There is no container header, so the ciphertext offset of
//! chunk N is always `N * (65536 + 28)` - seeking never requires decrypting
//! or scanning preceding chunks. That arithmetic is what makes scrubbing
//! through a multi-gigabyte encrypted video fast.
//!
//! ## Key Derivation
//!
//! The per-stream key is derived from a caller password with Argon2id over a
//! fresh random 16-byte salt. The salt is persisted *alongside* the
//! ciphertext (see [`StreamSalt`] and its `.salt` sidecar helpers) rather
//! than embedded, which keeps the chunk-offset formula exact. This is a
//! separate key path from the vault KDF and uses its own parameter profile.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::RngCore;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};

/// Plaintext bytes per chunk (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// AES-GCM nonce length
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag length
pub const TAG_SIZE: usize = 16;

/// Per-chunk ciphertext overhead: nonce + tag
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// On-disk bytes per full chunk
pub const ENCRYPTED_CHUNK_SIZE: usize = CHUNK_SIZE + CHUNK_OVERHEAD;

/// Argon2id salt length for the per-stream key
pub const SALT_SIZE: usize = 16;

/// Derived key length (AES-256)
pub const KEY_SIZE: usize = 32;

// Argon2id profile for the streaming path: same 64 MiB memory cost as the
// vault KDF but a single pass, since this key is derived once per open file
// rather than once per session.
const ARGON_MEMORY_KIB: u32 = 64 * 1024;
const ARGON_ITERATIONS: u32 = 1;
const ARGON_PARALLELISM: u32 = 4;

/// Chunk index containing the given plaintext offset.
#[inline]
pub fn chunk_index_for(plaintext_offset: u64) -> u64 {
    plaintext_offset / CHUNK_SIZE as u64
}

/// Ciphertext offset of the start of a chunk.
#[inline]
pub fn chunk_ciphertext_offset(chunk_index: u64) -> u64 {
    chunk_index * ENCRYPTED_CHUNK_SIZE as u64
}

/// Plaintext length implied by a ciphertext length.
///
/// A trailing fragment shorter than the chunk overhead cannot hold any
/// plaintext and counts as zero; full validation happens at decrypt time.
pub fn plaintext_len(ciphertext_len: u64) -> u64 {
    let full = ciphertext_len / ENCRYPTED_CHUNK_SIZE as u64;
    let rem = ciphertext_len % ENCRYPTED_CHUNK_SIZE as u64;
    let mut len = full * CHUNK_SIZE as u64;
    if rem > CHUNK_OVERHEAD as u64 {
        len += rem - CHUNK_OVERHEAD as u64;
    }
    len
}

/// Random per-stream KDF salt, persisted next to the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSalt([u8; SALT_SIZE]);

impl StreamSalt {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Sidecar path for a ciphertext file: `<file>.salt`
    pub fn sidecar_path(ciphertext_path: &Path) -> PathBuf {
        let mut name = ciphertext_path.as_os_str().to_owned();
        name.push(".salt");
        PathBuf::from(name)
    }

    pub async fn sidecar_exists(ciphertext_path: &Path) -> bool {
        fs::try_exists(Self::sidecar_path(ciphertext_path))
            .await
            .unwrap_or(false)
    }

    pub async fn write_sidecar(&self, ciphertext_path: &Path) -> CoreResult<()> {
        fs::write(Self::sidecar_path(ciphertext_path), self.0).await?;
        Ok(())
    }

    pub async fn read_sidecar(ciphertext_path: &Path) -> CoreResult<Self> {
        let sidecar = Self::sidecar_path(ciphertext_path);
        let data = fs::read(&sidecar).await?;
        if data.len() != SALT_SIZE {
            return Err(CoreError::storage(format!(
                "expected {}-byte salt at {} but found {} bytes",
                SALT_SIZE,
                sidecar.display(),
                data.len()
            )));
        }
        let mut bytes = [0u8; SALT_SIZE];
        bytes.copy_from_slice(&data);
        Ok(Self(bytes))
    }
}

fn derive_stream_key(password: &str, salt: &StreamSalt) -> CoreResult<Zeroizing<[u8; KEY_SIZE]>> {
    let params = Params::new(
        ARGON_MEMORY_KIB,
        ARGON_ITERATIONS,
        ARGON_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(password.as_bytes(), salt.as_bytes(), key.as_mut())
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Fills `buf` as far as the reader allows; a short count means EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Chunked AES-256-GCM stream cipher over a password-derived key.
///
/// Holds no shared state; any number of instances may encrypt or decrypt
/// concurrently. Operations await between chunks, so dropping the future
/// cancels promptly without emitting a partial chunk.
pub struct StreamCipher {
    cipher: Aes256Gcm,
}

impl StreamCipher {
    /// Derives the per-stream key and builds the cipher. The derived key is
    /// wiped as soon as the cipher is constructed.
    pub fn new(password: &str, salt: &StreamSalt) -> CoreResult<Self> {
        let key = derive_stream_key(password, salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .expect("BUG: derived key is always 32 bytes");
        Ok(Self { cipher })
    }

    /// Encrypts plaintext from `reader` into chunks on `writer`.
    ///
    /// Each chunk gets a fresh random nonce; the final chunk may be short but
    /// is sealed as its own authenticated unit. Empty input produces an empty
    /// ciphertext stream. Returns the total plaintext bytes consumed.
    pub async fn encrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> CoreResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = read_full(reader, &mut buffer).await?;
            if n == 0 {
                break;
            }

            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = self
                .cipher
                .encrypt(&nonce, &buffer[..n])
                .map_err(|_| CoreError::Crypto("chunk encryption failed".into()))?;

            writer.write_all(&nonce).await?;
            writer.write_all(&ciphertext).await?;
            total += n as u64;

            if n < CHUNK_SIZE {
                break;
            }
        }

        writer.flush().await?;
        Ok(total)
    }

    /// Decrypts a full chunk stream from `reader` into `writer`.
    ///
    /// Fails closed on the first chunk whose tag does not verify: nothing of
    /// the failing chunk is written. Chunks written before the failure stay
    /// written - this is a streaming API and the caller stops consuming on
    /// error. Returns the total plaintext bytes written.
    pub async fn decrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> CoreResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut nonce_buf = [0u8; NONCE_SIZE];
        let mut ct_buf = vec![0u8; CHUNK_SIZE + TAG_SIZE];
        let mut total = 0u64;

        loop {
            let n = read_full(reader, &mut nonce_buf).await?;
            if n == 0 {
                break;
            }
            if n < NONCE_SIZE {
                // Truncated mid-nonce: the stream cannot authenticate
                return Err(CoreError::Integrity);
            }

            let n = read_full(reader, &mut ct_buf).await?;
            if n < TAG_SIZE {
                return Err(CoreError::Integrity);
            }

            let plaintext = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce_buf), &ct_buf[..n])
                .map_err(|_| CoreError::Integrity)?;

            writer.write_all(&plaintext).await?;
            total += plaintext.len() as u64;

            if n < CHUNK_SIZE + TAG_SIZE {
                break;
            }
        }

        writer.flush().await?;
        Ok(total)
    }

    /// Decrypts exactly the plaintext byte window `[range_start, range_end]`
    /// (both inclusive) from a seekable ciphertext source.
    ///
    /// Seeks directly to the first covered chunk - earlier chunks are never
    /// read or decrypted. Every chunk overlapping the window is decrypted
    /// whole (GCM cannot authenticate a sub-chunk slice) and the output is
    /// trimmed to the requested window. Returns the plaintext bytes written,
    /// which may be short if the stream ends inside the window.
    pub async fn decrypt_range<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        range_start: u64,
        range_end: u64,
    ) -> CoreResult<u64>
    where
        R: AsyncRead + AsyncSeek + Unpin,
        W: AsyncWrite + Unpin,
    {
        if range_end < range_start {
            return Err(CoreError::MalformedRange(format!(
                "{}-{}",
                range_start, range_end
            )));
        }

        let first_chunk = chunk_index_for(range_start);
        let last_chunk = chunk_index_for(range_end);

        reader
            .seek(std::io::SeekFrom::Start(chunk_ciphertext_offset(first_chunk)))
            .await?;

        let mut nonce_buf = [0u8; NONCE_SIZE];
        let mut ct_buf = vec![0u8; CHUNK_SIZE + TAG_SIZE];
        let mut written = 0u64;

        for chunk_index in first_chunk..=last_chunk {
            let n = read_full(reader, &mut nonce_buf).await?;
            if n == 0 {
                break; // stream ended inside the window
            }
            if n < NONCE_SIZE {
                return Err(CoreError::Integrity);
            }

            let n = read_full(reader, &mut ct_buf).await?;
            if n < TAG_SIZE {
                return Err(CoreError::Integrity);
            }

            let plaintext = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce_buf), &ct_buf[..n])
                .map_err(|_| CoreError::Integrity)?;

            // Trim this chunk's plaintext to the requested window
            let chunk_start = chunk_index * CHUNK_SIZE as u64;
            let lo = range_start.saturating_sub(chunk_start).min(plaintext.len() as u64) as usize;
            let hi = ((range_end - chunk_start + 1).min(plaintext.len() as u64)) as usize;
            if lo < hi {
                writer.write_all(&plaintext[lo..hi]).await?;
                written += (hi - lo) as u64;
            }

            if n < CHUNK_SIZE + TAG_SIZE {
                break; // final chunk of the stream
            }
        }

        writer.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_cipher() -> StreamCipher {
        let salt = StreamSalt::from_bytes([0x07; SALT_SIZE]);
        StreamCipher::new("correct horse battery staple", &salt).expect("cipher")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn encrypt(cipher: &StreamCipher, data: &[u8]) -> Vec<u8> {
        let mut reader = Cursor::new(data.to_vec());
        let mut out = Vec::new();
        cipher
            .encrypt_stream(&mut reader, &mut out)
            .await
            .expect("encryption failed");
        out
    }

    #[tokio::test]
    async fn round_trip_all_boundary_sizes() {
        let cipher = make_cipher();
        for size in [0usize, 1, 65535, 65536, 65537, 200000] {
            let data = pattern(size);
            let encrypted = encrypt(&cipher, &data).await;

            let mut reader = Cursor::new(encrypted);
            let mut decrypted = Vec::new();
            let n = cipher
                .decrypt_stream(&mut reader, &mut decrypted)
                .await
                .expect("decryption failed");

            assert_eq!(decrypted, data, "size {}", size);
            assert_eq!(n, size as u64);
        }
    }

    #[tokio::test]
    async fn wrong_password_fails_closed() {
        let cipher = make_cipher();
        let encrypted = encrypt(&cipher, &pattern(1000)).await;

        let salt = StreamSalt::from_bytes([0x07; SALT_SIZE]);
        let other = StreamCipher::new("not the password", &salt).expect("cipher");
        let mut reader = Cursor::new(encrypted);
        let mut out = Vec::new();
        let result = other.decrypt_stream(&mut reader, &mut out).await;
        assert!(matches!(result, Err(CoreError::Integrity)));
        assert!(out.is_empty(), "no unauthenticated plaintext may be emitted");
    }

    #[tokio::test]
    async fn range_matches_slice_at_chunk_boundaries() {
        let cipher = make_cipher();
        let data = pattern(CHUNK_SIZE * 3 + 1000);
        let encrypted = encrypt(&cipher, &data).await;

        for (start, end) in [
            (65535u64, 65536u64),
            (65536, 65537),
            (0, 0),
            (0, 99),
            (70000, 190000),
            (196608, 197607), // exactly the final short chunk
        ] {
            let mut reader = Cursor::new(encrypted.clone());
            let mut out = Vec::new();
            let n = cipher
                .decrypt_range(&mut reader, &mut out, start, end)
                .await
                .expect("range decryption failed");

            let expected = &data[start as usize..=end as usize];
            assert_eq!(out, expected, "range {}-{}", start, end);
            assert_eq!(n, (end - start + 1));
        }
    }

    #[tokio::test]
    async fn tampered_chunk_fails_but_later_ranges_survive() {
        let cipher = make_cipher();
        let data = pattern(CHUNK_SIZE * 2 + 500);
        let mut encrypted = encrypt(&cipher, &data).await;

        // Flip a ciphertext bit inside chunk 0
        encrypted[NONCE_SIZE + 10] ^= 0x01;

        let mut reader = Cursor::new(encrypted.clone());
        let mut out = Vec::new();
        let result = cipher.decrypt_stream(&mut reader, &mut out).await;
        assert!(matches!(result, Err(CoreError::Integrity)));

        // A range entirely inside chunk 1 never touches the corrupted chunk
        let mut reader = Cursor::new(encrypted.clone());
        let mut out = Vec::new();
        cipher
            .decrypt_range(&mut reader, &mut out, CHUNK_SIZE as u64, CHUNK_SIZE as u64 + 99)
            .await
            .expect("later chunk must be unaffected");
        assert_eq!(out, &data[CHUNK_SIZE..CHUNK_SIZE + 100]);

        // Flipping a tag byte is caught the same way
        let mut tag_tampered = encrypt(&cipher, &data).await;
        let tag_pos = NONCE_SIZE + CHUNK_SIZE + TAG_SIZE - 1;
        tag_tampered[tag_pos] ^= 0x80;
        let mut reader = Cursor::new(tag_tampered);
        let mut out = Vec::new();
        assert!(matches!(
            cipher.decrypt_stream(&mut reader, &mut out).await,
            Err(CoreError::Integrity)
        ));
    }

    #[test]
    fn ciphertext_size_math() {
        assert_eq!(plaintext_len(0), 0);
        assert_eq!(plaintext_len(CHUNK_OVERHEAD as u64 + 1), 1);
        assert_eq!(plaintext_len(ENCRYPTED_CHUNK_SIZE as u64), CHUNK_SIZE as u64);
        assert_eq!(
            plaintext_len(ENCRYPTED_CHUNK_SIZE as u64 + CHUNK_OVERHEAD as u64 + 5),
            CHUNK_SIZE as u64 + 5
        );
        assert_eq!(chunk_index_for(0), 0);
        assert_eq!(chunk_index_for(65535), 0);
        assert_eq!(chunk_index_for(65536), 1);
        assert_eq!(chunk_ciphertext_offset(2), 2 * 65564);
    }

    #[tokio::test]
    async fn ciphertext_length_matches_plaintext_len_formula() {
        let cipher = make_cipher();
        for size in [0usize, 1, 65536, 130000] {
            let encrypted = encrypt(&cipher, &pattern(size)).await;
            assert_eq!(plaintext_len(encrypted.len() as u64), size as u64);
        }
    }

    #[tokio::test]
    async fn salt_sidecar_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let enc_path = tmp.path().join("movie.mp4.enc");

        let salt = StreamSalt::generate();
        salt.write_sidecar(&enc_path).await.unwrap();

        assert!(StreamSalt::sidecar_exists(&enc_path).await);
        let loaded = StreamSalt::read_sidecar(&enc_path).await.unwrap();
        assert_eq!(loaded, salt);
    }
}
