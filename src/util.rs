pub mod progress;

use anyhow::Result;
use std::fs::File;
use std::ops::Deref;
use std::os::unix::io::AsRawFd;
use std::path::Path;

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

fn munmap(start: *mut libc::c_void, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start, size) }, 0)
}

/// A read-only private mapping of a whole file
pub struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is read-only and never remapped, so sharing it is fine
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(p: impl AsRef<Path>) -> Result<MappedFile> {
        let file = File::open(p)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            // mmap rejects empty mappings
            return Ok(MappedFile {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(MappedFile { ptr, len })
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Err(e) = munmap(self.ptr, self.len) {
            warn!("Failed to unmap {} bytes at {:?}: {}", self.len, self.ptr, e);
        }
    }
}

/// Bytes of a dump, either mapped from disk or held in memory
pub enum DumpBytes {
    Mapped(MappedFile),
    Owned(Vec<u8>),
}

impl Deref for DumpBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            DumpBytes::Mapped(m) => m,
            DumpBytes::Owned(v) => v,
        }
    }
}

/// Decompress a zstd file fully into memory
pub fn read_zst(p: impl AsRef<Path>) -> Result<Vec<u8>> {
    use std::io::Read;
    let file = File::open(p)?;
    let mut reader = zstd::Decoder::new(file)?;
    let mut buf = vec![];
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mapped_file_matches_contents() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"JAVA PROFILE").unwrap();
        f.flush().unwrap();
        let m = MappedFile::open(f.path()).unwrap();
        assert_eq!(&m[..], b"JAVA PROFILE");
    }

    #[test]
    fn test_mapped_empty_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let m = MappedFile::open(f.path()).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn test_read_zst() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let compressed = zstd::encode_all(&b"hello heap"[..], 3).unwrap();
        f.write_all(&compressed).unwrap();
        f.flush().unwrap();
        assert_eq!(read_zst(f.path()).unwrap(), b"hello heap");
    }
}
