//! Storage abstraction for sequential binary data reading.
//!
//! Provides the [`Stream`] trait for reading binary data sequentially, with
//! implementations for in-memory buffers and standard I/O types.

use std::fmt;
use std::io;

/// Storage abstraction for the streamed reading of a WASM module.
pub trait Stream {
    /// Error type for storage-specific failures.
    type Error: fmt::Debug;

    /// Whether the given error signifies a failure to read due to having
    /// reached the end of the stream.
    fn is_eof(err: &Self::Error) -> bool;

    /// Returns the current byte offset into the stream.
    fn offset(&mut self) -> usize;

    /// Reads a single byte from the stream.
    fn read_byte(&mut self) -> Result<u8, Self::Error>;

    /// Reads exactly `buf.len()` bytes into the provided buffer.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        for byte in buf {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Skip the specified number of bytes in the stream.
    fn skip_bytes(&mut self, count: usize) -> Result<(), Self::Error> {
        for _ in 0..count {
            self.read_byte()?;
        }
        Ok(())
    }
}

/// Represents attempting to read past the end of an in-memory buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryEof;

/// In-memory buffer implementation of [`Stream`]. This is the storage used to
/// decode a whole `.wasm` file that has already been read into memory.
pub struct Buffer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Buffer<'a> {
    /// Create a new buffer stream over the given bytes.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl Stream for Buffer<'_> {
    type Error = MemoryEof;

    fn is_eof(_: &Self::Error) -> bool {
        true
    }

    fn offset(&mut self) -> usize {
        self.pos
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        if self.pos < self.bytes.len() {
            let byte = self.bytes[self.pos];
            self.pos += 1;
            Ok(byte)
        } else {
            Err(MemoryEof)
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        debug_assert!(self.pos <= self.bytes.len());
        if buf.len() <= self.bytes.len() - self.pos {
            buf.copy_from_slice(&self.bytes[self.pos..self.pos + buf.len()]);
            self.pos += buf.len();
            Ok(())
        } else {
            Err(MemoryEof)
        }
    }

    fn skip_bytes(&mut self, count: usize) -> Result<(), Self::Error> {
        debug_assert!(self.pos <= self.bytes.len());
        if count <= self.bytes.len() - self.pos {
            self.pos += count;
            Ok(())
        } else {
            Err(MemoryEof)
        }
    }
}

/// `Stream` implementation for `std::io` types, for callers that want to
/// decode directly from an open file without reading it into memory first.
impl<R: io::Read + io::Seek> Stream for R {
    type Error = io::Error;

    fn is_eof(err: &Self::Error) -> bool {
        err.kind() == io::ErrorKind::UnexpectedEof
    }

    fn offset(&mut self) -> usize {
        self.stream_position().unwrap().try_into().unwrap()
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        let mut buf = [0u8; 1];
        io::Read::read_exact(self, &mut buf)?;
        Ok(buf[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        io::Read::read_exact(self, buf)
    }

    fn skip_bytes(&mut self, count: usize) -> Result<(), Self::Error> {
        io::Seek::seek_relative(self, count.try_into().unwrap())
    }
}
