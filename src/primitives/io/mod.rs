#![forbid(unsafe_code)]
//! Positioned I/O on the file backing a volume.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{Result, StrataError};

/// Positioned reads and writes against one backing file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from offset `off`; reading past the end is an `UnexpectedEof` I/O error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes written data to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Shrinks or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
fn pread(file: &File, off: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, off)
}

#[cfg(unix)]
fn pwrite(file: &File, off: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, off)
}

#[cfg(windows)]
fn pread(file: &File, off: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, off)
}

#[cfg(windows)]
fn pwrite(file: &File, off: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, off)
}

/// [`FileIo`] over a file on disk.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    path: PathBuf,
}

impl StdFileIo {
    /// Creates a new file; fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::wrap(file, path))
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::wrap(file, path))
    }

    fn wrap(file: File, path: &Path) -> Self {
        Self {
            inner: Arc::new(file),
            path: path.to_path_buf(),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = pread(&self.inner, off, dst)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read reached EOF").into());
            }
            dst = &mut std::mem::take(&mut dst)[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = pwrite(&self.inner, off, src)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write stored zero bytes").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(|err| {
            warn!(path = %self.path.display(), error = %err, "io.sync_all.failed");
            StrataError::from(err)
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StrataError::from)
    }
}

/// Volatile [`FileIo`] backed by a growable byte vector.
///
/// Reads past the end fail with `UnexpectedEof`, matching [`StdFileIo`].
#[derive(Default)]
pub struct MemFileIo {
    bytes: Mutex<Vec<u8>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }
}

fn span(off: u64, len: usize) -> Result<(usize, usize)> {
    let start = usize::try_from(off).map_err(|_| StrataError::Invalid("offset overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or(StrataError::Invalid("offset overflow"))?;
    Ok((start, end))
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let (start, end) = span(off, dst.len())?;
        if end > bytes.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of memory file").into());
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let (start, end) = span(off, src.len())?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| StrataError::Invalid("length overflow"))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }
}
