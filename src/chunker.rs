use std::io::{self, Read};
use std::path::PathBuf;

use crate::chunk::Chunk;
use crate::error::{Result, ThinBackupError};

//------------------------------------------

/// Splits a dense byte stream into a sequence of [`Chunk`]s. Production code
/// is driven by the repository's real content-defined chunker (hashing,
/// compression and dedup boundaries are non-goals of this core); this fixed-
/// size splitter is the stand-in that lets the rest of the pipeline run
/// without one. A run of all-zero bytes is reported as a `Hole` chunk so
/// `align_new` can hand it straight back to the archive writer without the
/// repository needing to store it.
pub struct FixedSizeChunker<R> {
    reader: R,
    chunk_size: usize,
    path: PathBuf,
    done: bool,
}

impl<R: Read> FixedSizeChunker<R> {
    pub fn new(reader: R, chunk_size: usize, path: impl Into<PathBuf>) -> Self {
        assert!(chunk_size > 0);
        FixedSizeChunker {
            reader,
            chunk_size,
            path: path.into(),
            done: false,
        }
    }
}

impl<R: Read> Iterator for FixedSizeChunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Result<Chunk>> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(source) => {
                    self.done = true;
                    return Some(Err(ThinBackupError::DeviceIOError {
                        path: self.path.clone(),
                        offset: 0,
                        source,
                    }));
                }
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < buf.len() {
            self.done = true;
            buf.truncate(filled);
        }

        let chunk = if buf.iter().all(|b| *b == 0) {
            Chunk::hole(buf.len())
        } else {
            Chunk::data(buf)
        };
        Some(Ok(chunk))
    }
}

//------------------------------------------

/// Adapts a [`crate::dense_reader::DenseDeltaReader`] to `std::io::Read` so
/// it can feed a [`FixedSizeChunker`]. Kept separate from
/// `DenseDeltaReader::read`'s own inherent method (which returns the core's
/// typed `Result`) rather than implementing `Read` directly on it, so the
/// segment-level unit tests keep seeing the typed error.
pub struct AsRead<T>(pub T);

impl<R, I> Read for AsRead<crate::dense_reader::DenseDeltaReader<R, I>>
where
    R: crate::positioned_read::PositionedRead,
    I: Iterator<Item = crate::segment::Segment>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

//------------------------------------------


//------------------------------------------
