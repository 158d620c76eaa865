//! SHA-512 content digests of image streams.

use std::io::{self, Read};

use sha2::{Digest, Sha512};

/// Prefix of every digest produced by [`HashingReader::finish`].
pub const DIGEST_PREFIX: &str = "sha512-";

/// Reader adapter that hashes every byte passing through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha512,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
            bytes: 0,
        }
    }

    /// Returns how many bytes have been read so far.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Reads whatever is left of the stream and returns the digest of the
    /// whole stream as `sha512-<hex>`.
    ///
    /// Archive readers stop at the end-of-archive marker, so the trailing
    /// padding is only hashed here.
    ///
    /// # Errors
    ///
    /// Returns the underlying read error.
    pub fn finish(mut self) -> io::Result<String> {
        let _ = io::copy(&mut self, &mut io::sink())?;
        Ok(format!("{DIGEST_PREFIX}{:x}", self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_covers_unread_tail() {
        let mut reader = HashingReader::new(&b"abc"[..]);
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(reader.bytes_read(), 1);

        let digest = reader.finish().unwrap();
        assert_eq!(
            digest,
            "sha512-ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn empty_stream_has_digest() {
        let digest = HashingReader::new(io::empty()).finish().unwrap();
        assert!(digest.starts_with(DIGEST_PREFIX));
        assert_eq!(digest.len(), DIGEST_PREFIX.len() + 128);
    }
}
