use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

//------------------------------------------

/// A narrow capability over "read `buf.len()` bytes at absolute offset
/// `offset`, without relying on or mutating the file's cursor". Lets
/// `DenseDeltaReader` issue concurrent-safe positioned reads and lets tests
/// swap in anything backed by a real file descriptor.
pub trait PositionedRead {
    fn pread_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl PositionedRead for File {
    fn pread_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl PositionedRead for Box<dyn PositionedRead> {
    fn pread_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).pread_at(buf, offset)
    }
}

//------------------------------------------
