//! Streaming encryption of a whole file through [`std::io::Write`].

use std::io::{self, Write};

use tracing::trace;
use zeroize::Zeroizing;

use super::{CHUNK_PLAINTEXT_SIZE, FileCryptor, FileHeader};

/// Encrypts everything written to it into `inner`.
///
/// The header is written before the first chunk. Cleartext is buffered until a
/// full chunk is available, and the final (possibly empty) chunk is only
/// written by [`finish`](Self::finish). At least one chunk is always produced,
/// so an empty file is still authenticated.
///
/// Dropping the writer without calling `finish` leaves the output truncated;
/// readers will reject it.
pub struct EncryptingWriter<'a, W: Write> {
    inner: W,
    cryptor: &'a FileCryptor,
    header: FileHeader,
    buffer: Zeroizing<Vec<u8>>,
    chunk_number: u64,
    header_written: bool,
}

impl<'a, W: Write> EncryptingWriter<'a, W> {
    pub fn new(inner: W, cryptor: &'a FileCryptor) -> Self {
        Self {
            inner,
            cryptor,
            header: cryptor.create_header(),
            buffer: Zeroizing::new(Vec::with_capacity(CHUNK_PLAINTEXT_SIZE)),
            chunk_number: 0,
            header_written: false,
        }
    }

    fn write_chunk(&mut self) -> io::Result<()> {
        if !self.header_written {
            let header = self
                .cryptor
                .encrypt_header(&self.header)
                .map_err(io::Error::other)?;
            self.inner.write_all(&header)?;
            self.header_written = true;
        }

        let sealed = self
            .cryptor
            .encrypt_chunk(&self.buffer, self.chunk_number, &self.header)
            .map_err(io::Error::other)?;
        self.inner.write_all(&sealed)?;
        trace!(chunk = self.chunk_number, size = self.buffer.len(), "Wrote encrypted chunk");

        self.chunk_number += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Write the final chunk, flush, and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_chunk()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len() == CHUNK_PLAINTEXT_SIZE {
            self.write_chunk()?;
        }
        let n = buf.len().min(CHUNK_PLAINTEXT_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Flushes the inner writer only; buffered cleartext stays until the
    /// chunk is full or the writer is finished.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CHUNK_ENCRYPTED_SIZE, CHUNK_OVERHEAD, HEADER_SIZE};

    fn encrypt(cryptor: &FileCryptor, content: &[u8]) -> Vec<u8> {
        let mut writer = EncryptingWriter::new(Vec::new(), cryptor);
        writer.write_all(content).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_empty_content_has_one_chunk() {
        let cryptor = FileCryptor::random();
        let encrypted = encrypt(&cryptor, b"");
        assert_eq!(encrypted.len(), HEADER_SIZE + CHUNK_OVERHEAD);
        assert!(cryptor.decrypt_file(&encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_exact_chunk_has_no_trailing_empty_chunk() {
        let cryptor = FileCryptor::random();
        let content = vec![0x42; CHUNK_PLAINTEXT_SIZE];
        let encrypted = encrypt(&cryptor, &content);
        assert_eq!(encrypted.len(), HEADER_SIZE + CHUNK_ENCRYPTED_SIZE);
        assert_eq!(cryptor.decrypt_file(&encrypted).unwrap(), content);
    }

    #[test]
    fn test_multi_chunk_content() {
        let cryptor = FileCryptor::random();
        let content: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let encrypted = encrypt(&cryptor, &content);
        assert_eq!(
            encrypted.len(),
            HEADER_SIZE + 2 * CHUNK_ENCRYPTED_SIZE + (70_000 - 2 * CHUNK_PLAINTEXT_SIZE) + CHUNK_OVERHEAD
        );
        assert_eq!(cryptor.decrypt_file(&encrypted).unwrap(), content);
    }

    #[test]
    fn test_unfinished_writer_emits_nothing() {
        let cryptor = FileCryptor::random();
        let mut out = Vec::new();
        {
            let mut writer = EncryptingWriter::new(&mut out, &cryptor);
            writer.write_all(b"not yet a full chunk").unwrap();
        }
        assert!(out.is_empty());
    }
}
