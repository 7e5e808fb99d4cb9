//! Streaming SHA-256 over byte sources.
//!
//! Fixed chunk size, O(chunk) memory regardless of file size. Errors
//! propagate verbatim; retry is the caller's concern. Cancellation is
//! observed at chunk boundaries and surfaces as `ErrorKind::Interrupted`
//! so the retry policy classifies it as transient.

use crate::cancel::CancellationToken;
use forker_protocol::defaults::{CANCELLED_MESSAGE, DEFAULT_BUFFER_SIZE_BYTES};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default streaming chunk: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_BUFFER_SIZE_BYTES;

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, CANCELLED_MESSAGE)
}

/// Hash everything a reader yields. Returns `(bytes_read, hex_digest)`.
pub async fn hash_reader<R>(
    reader: &mut R,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> io::Result<(u64, String)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Hash a file opened with shared read access.
pub async fn hash_file(
    path: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file, chunk_size, cancel).await
}

/// Single-pass copy + hash: stream reader to writer, hashing the exact
/// bytes written. Returns `(bytes_copied, hex_digest)`. The writer is not
/// flushed or synced here; the caller owns the commit protocol.
pub async fn tee_hash<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> io::Result<(u64, String)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn empty_input_hashes_to_empty_string_digest() {
        let cancel = CancellationToken::new();
        let mut reader: &[u8] = &[];
        let (bytes, hash) = hash_reader(&mut reader, DEFAULT_CHUNK_SIZE, &cancel)
            .await
            .unwrap();
        assert_eq!(bytes, 0);
        assert_eq!(hash, EMPTY_SHA256);
    }

    #[tokio::test]
    async fn known_digest() {
        let cancel = CancellationToken::new();
        let mut reader: &[u8] = b"abc";
        let (bytes, hash) = hash_reader(&mut reader, DEFAULT_CHUNK_SIZE, &cancel)
            .await
            .unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn tee_hash_matches_rehash_of_written_bytes() {
        let cancel = CancellationToken::new();
        let payload = vec![0xA5u8; 3 * 1024 + 17];
        let mut reader: &[u8] = &payload;
        let mut written = Vec::new();
        // Chunk smaller than the payload to exercise the loop.
        let (bytes, hash) = tee_hash(&mut reader, &mut written, 1024, &cancel)
            .await
            .unwrap();
        assert_eq!(bytes, payload.len() as u64);
        assert_eq!(written, payload);

        let mut rereader: &[u8] = &written;
        let (_, rehash) = hash_reader(&mut rereader, 1024, &cancel).await.unwrap();
        assert_eq!(hash, rehash);
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader: &[u8] = b"data";
        let err = hash_reader(&mut reader, 4, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn hash_file_round_trip() {
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        tokio::fs::write(&path, b"medical imaging bytes").await.unwrap();
        let (bytes, hash) = hash_file(&path, DEFAULT_CHUNK_SIZE, &cancel).await.unwrap();
        assert_eq!(bytes, 21);
        assert_eq!(hash.len(), 64);
    }
}
