use std::path::{Path, PathBuf};

use crate::error::{Result, ThinBackupError};
use crate::positioned_read::PositionedRead;
use crate::segment::{Segment, SegmentKind};

//------------------------------------------

// The `NEW` segment currently being drained: the absolute byte offset of the
// next unread byte, and how many bytes are left in this segment.
struct Active {
    offset: u64,
    remaining: u64,
}

/// A sequential, single-reader byte stream over the concatenation of every
/// `NEW` segment of a device, in segment order. `HOLE` and `OLD` segments are
/// skipped without touching the device.
///
/// Reads are issued with absolute offsets (`pread`), so the reader never
/// relies on or mutates the file's cursor; a `DenseDeltaReader` may coexist
/// with other positioned-read users of the same descriptor as long as they
/// don't also call `read` concurrently on the same instance.
pub struct DenseDeltaReader<R, I> {
    dev: R,
    path: PathBuf,
    block_size: u64,
    segments: I,
    active: Option<Active>,
    eof: bool,
}

impl<R, I> DenseDeltaReader<R, I>
where
    R: PositionedRead,
    I: Iterator<Item = Segment>,
{
    pub fn new(dev: R, path: impl AsRef<Path>, block_size: u64, segments: I) -> Self {
        DenseDeltaReader {
            dev,
            path: path.as_ref().to_path_buf(),
            block_size,
            segments,
            active: None,
            eof: false,
        }
    }

    /// Fills `buf` with up to `buf.len()` bytes of `NEW`-segment content,
    /// returning the number of bytes actually written. A zero-length result
    /// signals end of stream. Short reads are otherwise only guaranteed at
    /// end of stream; this implementation opportunistically spans `HOLE`/
    /// `OLD` gaps and segment transitions within one call so the output
    /// reads as a genuinely dense stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0usize;

        while filled < buf.len() {
            if self.active.is_none() {
                match self.next_new_segment() {
                    Some(active) => self.active = Some(active),
                    None => {
                        self.eof = true;
                        break;
                    }
                }
            }

            let active = self.active.as_mut().unwrap();
            let want = (buf.len() - filled).min(active.remaining as usize);
            let got = self.read_fully(active.offset, &mut buf[filled..filled + want])?;

            active.offset += got as u64;
            active.remaining -= got as u64;
            filled += got;

            if active.remaining == 0 {
                self.active = None;
            }
        }

        Ok(filled)
    }

    // Advances `self.segments` until it finds (or fails to find) the next
    // `NEW` segment, returning its absolute byte range.
    fn next_new_segment(&mut self) -> Option<Active> {
        for seg in self.segments.by_ref() {
            if seg.kind == SegmentKind::New {
                return Some(Active {
                    offset: seg.begin * self.block_size,
                    remaining: seg.length * self.block_size,
                });
            }
        }
        None
    }

    // Repeatedly issues `pread` at `offset` until `buf` is completely filled
    // or an unrecoverable zero-byte read occurs (end of device within a
    // `NEW` segment, which should never happen for a well-formed segment
    // map and is reported as `ShortDeviceRead`).
    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = self
                .dev
                .pread_at(&mut buf[done..], offset + done as u64)
                .map_err(|source| ThinBackupError::DeviceIOError {
                    path: self.path.clone(),
                    offset: offset + done as u64,
                    source,
                })?;
            if n == 0 {
                return Err(ThinBackupError::ShortDeviceRead {
                    path: self.path.clone(),
                    offset: offset + done as u64,
                    expected: buf.len() - done,
                    got: 0,
                });
            }
            done += n;
        }
        Ok(done)
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.active.is_none()
    }
}

//------------------------------------------


//------------------------------------------
