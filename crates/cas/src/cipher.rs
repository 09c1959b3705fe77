//! AES-256-CTR stream cipher for encrypting content at rest or in flight.
//!
//! Not wired into replication. Callers wrap store or peer copies with
//! [`copy_encrypt`] / [`copy_decrypt`] when they want privacy.
//!
//! Output format of [`copy_encrypt`]: `iv (16 bytes) || ciphertext`.
//! CTR mode preserves length, so ciphertext is exactly as long as the input.

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// IV length in bytes, written ahead of every ciphertext.
pub const IV_LEN: usize = 16;

const CHUNK: usize = 32 * 1024;

/// A symmetric key for [`copy_encrypt`] and [`copy_decrypt`].
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt everything from `src` into `dst`, prefixed with a random IV.
///
/// Returns the total bytes written to `dst`, IV included.
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(&(*key.as_bytes()).into(), &iv.into());
    let body = apply_stream(&mut cipher, src, dst).await?;

    Ok(IV_LEN as u64 + body)
}

/// Decrypt an IV-prefixed stream produced by [`copy_encrypt`].
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await?;

    let mut cipher = Aes256Ctr::new(&(*key.as_bytes()).into(), &iv.into());
    apply_stream(&mut cipher, src, dst).await
}

async fn apply_stream<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    dst.flush().await?;
    Ok(total)
}
