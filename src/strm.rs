//! Stream adapters for changeset I/O.
//!
//! The binary changeset operations move data in fixed-size chunks. These
//! adapters bridge arbitrary `std::io` streams to that pull/push protocol:
//! a reader fills whole chunks until end-of-stream, a writer pushes exact
//! slices and flushes after each push. An adapter owns its stream, so all
//! partial-transfer state for one stream lives in exactly one place.

use std::io::{Read, Write};

use crate::error::{Error, ErrorCode, Result};

/// Default chunk size for streamed changeset data, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Pull side of the streaming protocol.
pub struct ChunkedReader<'a> {
    inner: Box<dyn Read + 'a>,
    chunk_size: usize,
}

impl<'a> ChunkedReader<'a> {
    /// Wrap an input stream. A `chunk_size` of 0 falls back to the default.
    pub fn new(stream: impl Read + 'a, chunk_size: usize) -> Self {
        Self {
            inner: Box::new(stream),
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
        }
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Pull the next chunk, appending to `buf`.
    ///
    /// Returns the number of bytes appended. The count is less than the
    /// chunk size only at end-of-stream; 0 signals EOF. Short reads from the
    /// underlying stream are retried until the chunk fills or the stream
    /// ends.
    pub fn fill(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut total = 0;
        while total < chunk.len() {
            match self.inner.read(&mut chunk[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(ErrorCode::IoRead, "changeset input", e)),
            }
        }
        buf.extend_from_slice(&chunk[..total]);
        Ok(total)
    }

    /// Drain the stream to the end, appending everything to `buf`.
    pub fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.fill(buf)?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }
}

/// Push side of the streaming protocol.
pub struct ChunkedWriter<'a> {
    inner: Box<dyn Write + 'a>,
    chunk_size: usize,
}

impl<'a> ChunkedWriter<'a> {
    /// Wrap an output stream. A `chunk_size` of 0 falls back to the default.
    pub fn new(stream: impl Write + 'a, chunk_size: usize) -> Self {
        Self {
            inner: Box::new(stream),
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
        }
    }

    /// Push exactly one slice, then flush.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .and_then(|_| self.inner.flush())
            .map_err(|e| Error::io(ErrorCode::IoWrite, "changeset output", e))
    }

    /// Push a full buffer as a sequence of chunk-sized slices.
    pub fn push_chunked(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            self.push(chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fill_reports_eof_as_zero() {
        let data = vec![7u8; 10];
        let mut reader = ChunkedReader::new(Cursor::new(data), 4);
        let mut buf = Vec::new();
        assert_eq!(reader.fill(&mut buf).unwrap(), 4);
        assert_eq!(reader.fill(&mut buf).unwrap(), 4);
        assert_eq!(reader.fill(&mut buf).unwrap(), 2);
        assert_eq!(reader.fill(&mut buf).unwrap(), 0);
        assert_eq!(buf, vec![7u8; 10]);
    }

    #[test]
    fn test_read_to_end() {
        let data: Vec<u8> = (0..100).collect();
        let mut reader = ChunkedReader::new(Cursor::new(data.clone()), 16);
        let mut buf = Vec::new();
        assert_eq!(reader.read_to_end(&mut buf).unwrap(), 100);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_push_chunked_preserves_bytes() {
        let mut out = Vec::new();
        {
            let mut writer = ChunkedWriter::new(&mut out, 8);
            writer.push_chunked(&[1u8; 20]).unwrap();
        }
        assert_eq!(out, vec![1u8; 20]);
    }

    #[test]
    fn test_zero_chunk_size_uses_default() {
        let reader = ChunkedReader::new(Cursor::new(Vec::new()), 0);
        assert_eq!(reader.chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
