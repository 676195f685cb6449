//! Read-only memory-mapped backing-store access.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;

use bdproxy_core::security::MAX_MMAP_SIZE;

/// A read-only view over a memory-mapped file, addressed by absolute
/// offset rather than a seek cursor.
///
/// # Safety
///
/// Uses `unsafe` for memory mapping because:
/// - the OS guarantees memory safety for a valid file descriptor
/// - the file is validated as a regular file before mapping
/// - the mapping is `MAP_PRIVATE` (read-only, no write-through)
/// - the file must not be truncated during access (caller responsibility)
pub struct MmapPipeline {
    mmap: Mmap,
}

impl MmapPipeline {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only regular files can be memory-mapped",
            ));
        }
        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "file size {} exceeds memory mapping limit {MAX_MMAP_SIZE}",
                    metadata.len()
                ),
            ));
        }

        // SAFETY: file is a validated regular file within the size limit;
        // mapping is read-only (MAP_PRIVATE).
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_full_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.len();
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let end = (start + buf.len()).min(self.mmap.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.mmap[start..end]);
        Ok(n)
    }
}

/// A real, runtime-reachable backing store for read-only raw opens: the
/// bootstrap path falls back to `FileStore` whenever mapping fails (an
/// oversized file, or one that isn't a regular file).
impl bdproxy_store::BackingStore for MmapPipeline {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.read_at(offset, buf)
    }

    fn pwrite(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "memory-mapped backing store is read-only",
        ))
    }

    fn len(&self) -> u64 {
        MmapPipeline::len(self)
    }

    fn is_empty(&self) -> bool {
        MmapPipeline::is_empty(self)
    }

    fn read_only(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_file() -> NamedTempFile {
        let mut tmpfile = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..100u32).map(|n| n as u8).collect();
        tmpfile.write_all(&data).unwrap();
        tmpfile.flush().unwrap();
        tmpfile
    }

    #[test]
    fn opens_and_reports_length() {
        let tmpfile = sample_file();
        let pipeline = MmapPipeline::open(tmpfile.path()).unwrap();
        assert_eq!(pipeline.len(), 100);
        assert!(!pipeline.is_empty());
    }

    #[test]
    fn reads_at_offset() {
        let tmpfile = sample_file();
        let pipeline = MmapPipeline::open(tmpfile.path()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(pipeline.read_at(50, &mut buf).unwrap(), 5);
        assert_eq!(buf, [50, 51, 52, 53, 54]);
    }

    #[test]
    fn read_clips_at_eof() {
        let tmpfile = sample_file();
        let pipeline = MmapPipeline::open(tmpfile.path()).unwrap();
        let mut buf = [0u8; 20];
        assert_eq!(pipeline.read_at(90, &mut buf).unwrap(), 10);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let tmpfile = sample_file();
        let pipeline = MmapPipeline::open(tmpfile.path()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(pipeline.read_at(200, &mut buf).unwrap(), 0);
    }

    #[test]
    fn full_slice_matches_file_contents() {
        let tmpfile = sample_file();
        let pipeline = MmapPipeline::open(tmpfile.path()).unwrap();
        assert_eq!(pipeline.as_full_slice().len(), 100);
        assert_eq!(pipeline.as_full_slice()[0], 0);
        assert_eq!(pipeline.as_full_slice()[99], 99);
    }
}
