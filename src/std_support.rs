//! `std`-only convenience pieces, gated behind the `std` feature: hosts
//! embedding this crate in an ordinary process can use [`StdFile`] instead
//! of writing their own [`crate::host::HostFile`] over `std::fs::File`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{self, Result};
use crate::host::HostFile;

/// Wraps a [`std::fs::File`] as a [`HostFile`]. Not the fastest possible
/// implementation (it seeks before every read rather than using a
/// platform-specific positioned-read syscall), but it's portable across
/// every `std` target without extra platform-specific dependencies.
pub struct StdFile(File);

impl StdFile {
    pub fn new(file: File) -> Self {
        StdFile(file)
    }
}

impl From<File> for StdFile {
    fn from(file: File) -> Self {
        StdFile::new(file)
    }
}

impl HostFile for StdFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.0
            .seek(SeekFrom::Start(offset))
            .map_err(|e| error::io_error(e))?;
        let mut read = 0;
        while read < buf.len() {
            match self.0.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => return Err(error::io_error(e)),
            }
        }
        Ok(read)
    }
}
