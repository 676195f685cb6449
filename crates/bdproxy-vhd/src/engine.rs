//! Read and write access to a VHD image by logical (virtual-disk) offset.
//!
//! Fixed VHDs are a flat byte range preceding a trailing footer; reads and
//! writes there are a straight positioned pass-through. Dynamic VHDs store
//! data in block-sized chunks located through a Block Allocation Table
//! (BAT); a read of an unallocated block returns zeros without touching
//! disk, and a write to an unallocated block allocates one, unless the
//! write is itself all zero — in which case the block is left sparse,
//! since an unallocated block already reads as zero.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bdproxy_core::{Error, Result};

use crate::types::{BlockAllocationTable, VhdDynamicHeader, VhdFooter, VhdType};

const SECTOR_SIZE: u64 = 512;

fn bitmap_size_bytes(block_size: u32) -> u64 {
    let sectors_per_block = block_size as u64 / SECTOR_SIZE;
    let bitmap_bytes = sectors_per_block.div_ceil(8);
    bitmap_bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

struct DynamicState {
    footer: VhdFooter,
    block_size: u32,
    bitmap_size: u64,
    bat: BlockAllocationTable,
    table_offset: u64,
    virtual_size: u64,
    /// Current physical length of the file, including the trailing footer.
    /// Tracked separately from `file.metadata()` since we grow the file by
    /// direct writes past the old EOF rather than by truncate/set_len.
    physical_len: u64,
}

enum Kind {
    Fixed { content_len: u64 },
    Dynamic(Box<DynamicState>),
}

/// An open VHD image (fixed or dynamic), addressed by virtual-disk offset.
pub struct VhdEngine {
    file: File,
    kind: Kind,
}

impl VhdEngine {
    /// Does `path` look like a VHD (valid footer at the end)? Used by the
    /// bootstrap to auto-detect VHD images without requiring a `.vhd` name.
    pub fn probe(path: &Path) -> io::Result<bool> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < VhdFooter::SIZE as u64 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-(VhdFooter::SIZE as i64)))?;
        let mut bytes = [0u8; VhdFooter::SIZE];
        file.read_exact(&mut bytes)?;
        Ok(&bytes[0..8] == VhdFooter::COOKIE)
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len < VhdFooter::SIZE as u64 {
            return Err(Error::invalid_image("file too small to be a VHD"));
        }

        file.seek(SeekFrom::End(-(VhdFooter::SIZE as i64)))?;
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        file.read_exact(&mut footer_bytes)?;
        let footer = VhdFooter::parse(&footer_bytes)?;
        if !footer.verify_checksum() {
            return Err(Error::ChecksumVerification("VHD footer".into()));
        }

        match footer.disk_type {
            VhdType::Fixed => Ok(Self {
                file,
                kind: Kind::Fixed {
                    content_len: file_len - VhdFooter::SIZE as u64,
                },
            }),
            VhdType::Dynamic => {
                file.seek(SeekFrom::Start(footer.data_offset))?;
                let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
                file.read_exact(&mut header_bytes)?;
                let dynamic_header = VhdDynamicHeader::parse(&header_bytes)?;
                if !dynamic_header.verify_checksum() {
                    return Err(Error::ChecksumVerification("VHD dynamic header".into()));
                }

                bdproxy_core::security::validate_allocation_size(
                    dynamic_header.max_table_entries as u64 * 4,
                    bdproxy_core::security::MAX_BAT_SIZE,
                    "VHD BAT",
                )?;

                file.seek(SeekFrom::Start(dynamic_header.table_offset))?;
                let bat_size = dynamic_header.max_table_entries as usize * 4;
                let mut bat_bytes = vec![0u8; bat_size];
                file.read_exact(&mut bat_bytes)?;
                let bat = BlockAllocationTable::parse(&bat_bytes)?;

                let virtual_size = footer.current_size;
                let block_size = dynamic_header.block_size;
                let bitmap_size = bitmap_size_bytes(block_size);
                let table_offset = dynamic_header.table_offset;

                Ok(Self {
                    file,
                    kind: Kind::Dynamic(Box::new(DynamicState {
                        footer,
                        block_size,
                        bitmap_size,
                        bat,
                        table_offset,
                        virtual_size,
                        physical_len: file_len,
                    })),
                })
            }
            other => Err(Error::unsupported(format!(
                "VHD disk type {other:?} is not supported"
            ))),
        }
    }

    /// Attempts to take an exclusive advisory lock on the backing file.
    /// Mirrors `bdproxy_store::FileStore::try_lock_exclusive`; returns
    /// `Ok(false)`, not an error, when another process already holds it.
    #[cfg(unix)]
    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            Ok(true)
        } else {
            match io::Error::last_os_error().kind() {
                io::ErrorKind::WouldBlock => Ok(false),
                kind => Err(kind.into()),
            }
        }
    }

    #[cfg(windows)]
    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };
        use windows_sys::Win32::System::IO::OVERLAPPED;

        let handle = self.file.as_raw_handle() as windows_sys::Win32::Foundation::HANDLE;
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        // SAFETY: `handle` stays valid for the lifetime of `self.file`.
        let ok = unsafe {
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            Ok(true)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        Ok(true)
    }

    /// Virtual disk size in bytes, as reported by the INFO response.
    pub fn len(&self) -> u64 {
        match &self.kind {
            Kind::Fixed { content_len } => *content_len,
            Kind::Dynamic(state) => state.virtual_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, Kind::Dynamic(_))
    }

    pub fn read_at(&mut self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<usize> {
        let total_len = self.len();
        if offset >= total_len {
            return Ok(0);
        }
        buf = &mut buf[..buf.len().min((total_len - offset) as usize)];
        let requested = buf.len();

        match &self.kind {
            Kind::Fixed { .. } => {
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(buf)?;
                Ok(requested)
            }
            Kind::Dynamic(_) => {
                let mut done = 0usize;
                while done < requested {
                    let chunk = self.read_one_block(offset, &mut buf[done..])?;
                    offset += chunk as u64;
                    done += chunk;
                }
                Ok(done)
            }
        }
    }

    /// Read at most one block's worth, clipped to the block boundary.
    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Kind::Dynamic(state) = &self.kind else {
            unreachable!("read_one_block only called for dynamic images")
        };
        let block_size = state.block_size as u64;
        let block_index = (offset / block_size) as usize;
        let block_offset = offset % block_size;
        let chunk = buf.len().min((block_size - block_offset) as usize);

        match state.bat.get_block_offset(block_index) {
            Some(physical_offset) => {
                let pos = physical_offset + state.bitmap_size + block_offset;
                self.file.seek(SeekFrom::Start(pos))?;
                self.file.read_exact(&mut buf[..chunk])?;
            }
            None => {
                buf[..chunk].fill(0);
            }
        }
        Ok(chunk)
    }

    pub fn write_at(&mut self, mut offset: u64, mut buf: &[u8]) -> io::Result<usize> {
        let total_len = self.len();
        if offset >= total_len {
            return Ok(0);
        }
        buf = &buf[..buf.len().min((total_len - offset) as usize)];
        let requested = buf.len();

        match &self.kind {
            Kind::Fixed { .. } => {
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.write_all(buf)?;
                Ok(requested)
            }
            Kind::Dynamic(_) => {
                let mut done = 0usize;
                while done < requested {
                    let chunk = self.write_one_block(offset, &buf[done..])?;
                    offset += chunk as u64;
                    done += chunk;
                }
                Ok(done)
            }
        }
    }

    /// Write at most one block's worth, clipped to the block boundary,
    /// allocating the block first if necessary.
    fn write_one_block(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let (block_size, block_offset, chunk, block_index, already_allocated) = {
            let Kind::Dynamic(state) = &self.kind else {
                unreachable!("write_one_block only called for dynamic images")
            };
            let block_size = state.block_size as u64;
            let block_index = (offset / block_size) as usize;
            let block_offset = offset % block_size;
            let chunk = buf.len().min((block_size - block_offset) as usize);
            (
                block_size,
                block_offset,
                chunk,
                block_index,
                state.bat.is_allocated(block_index),
            )
        };

        if !already_allocated {
            // A write that is entirely zero into an unallocated block needs
            // no allocation: the block already reads back as zero.
            if buf[..chunk].iter().all(|&b| b == 0) {
                return Ok(chunk);
            }
            self.allocate_block(block_index)?;
        }

        let Kind::Dynamic(state) = &self.kind else {
            unreachable!()
        };
        let physical_offset = state
            .bat
            .get_block_offset(block_index)
            .expect("block was just allocated");
        let pos = physical_offset + state.bitmap_size + block_offset;
        let _ = block_size;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&buf[..chunk])?;
        Ok(chunk)
    }

    /// Allocate a new block at the current physical end of file, relocating
    /// the trailing footer past it, and record the allocation in the BAT
    /// (both in memory and on disk).
    fn allocate_block(&mut self, block_index: usize) -> io::Result<()> {
        let Kind::Dynamic(state) = &mut self.kind else {
            unreachable!("allocate_block only called for dynamic images")
        };

        let new_block_start = state.physical_len - VhdFooter::SIZE as u64;
        if !new_block_start.is_multiple_of(SECTOR_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VHD footer is not sector-aligned",
            ));
        }
        let new_sector = new_block_start / SECTOR_SIZE;

        let region_len = state.bitmap_size + state.block_size as u64;
        let mut region = vec![0u8; region_len as usize];
        region[..state.bitmap_size as usize].fill(0xFF);

        self.file.seek(SeekFrom::Start(new_block_start))?;
        self.file.write_all(&region)?;

        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        state.footer.serialize(&mut footer_bytes);
        self.file.write_all(&footer_bytes)?;

        state.bat.set(block_index, new_sector as u32);
        let entry_offset = state.table_offset + (block_index as u64) * 4;
        self.file.seek(SeekFrom::Start(entry_offset))?;
        self.file
            .write_all(&BlockAllocationTable::serialize_entry(new_sector as u32))?;

        state.physical_len = new_block_start + region_len + VhdFooter::SIZE as u64;
        self.file.flush()
    }
}

/// Lets `PartialPipeline<VhdEngine>` window a VHD without naming its
/// concrete type. Shadowed by (and simply forwards to) the inherent
/// `read_at`/`write_at` above, which Rust resolves in preference to this
/// trait impl on direct method calls.
impl bdproxy_core::OffsetStore for VhdEngine {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        VhdEngine::read_at(self, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        VhdEngine::write_at(self, offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiskGeometry;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn test_footer(size: u64, disk_type: VhdType) -> VhdFooter {
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 2,
            version: 0x0001_0000,
            data_offset: if disk_type == VhdType::Fixed {
                u64::MAX
            } else {
                512
            },
            timestamp: 0,
            creator_app: *b"test",
            creator_version: 0x0001_0000,
            creator_os: 0x5769_326B,
            original_size: size,
            current_size: size,
            geometry: DiskGeometry::from_size(size),
            disk_type,
            checksum: 0,
            uuid: [0u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.recompute_checksum();
        footer
    }

    fn test_dynamic_header(max_table_entries: u32, block_size: u32) -> VhdDynamicHeader {
        let bat_offset = (VhdFooter::SIZE + VhdDynamicHeader::SIZE) as u64;
        let mut header = VhdDynamicHeader {
            cookie: *VhdDynamicHeader::COOKIE,
            data_offset: u64::MAX,
            table_offset: bat_offset,
            header_version: 0x0001_0000,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uuid: [0u8; 16],
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u16; 256],
            parent_locator_entries: [[0u8; 24]; 8],
            reserved2: [0u8; 256],
        };
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);
        let mut sum: u32 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if (36..40).contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(b as u32);
        }
        header.checksum = !sum;
        header
    }

    fn build_fixed(data_size: usize) -> Vec<u8> {
        let mut vhd = vec![0u8; data_size];
        for (i, b) in vhd.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let footer = test_footer(data_size as u64, VhdType::Fixed);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);
        vhd.extend_from_slice(&footer_bytes);
        vhd
    }

    fn build_dynamic_all_sparse(virtual_size: u64, block_size: u32) -> Vec<u8> {
        let block_count = virtual_size.div_ceil(block_size as u64) as u32;
        let footer = test_footer(virtual_size, VhdType::Dynamic);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);

        let mut vhd = Vec::new();
        vhd.extend_from_slice(&footer_bytes);
        let header = test_dynamic_header(block_count, block_size);
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);
        vhd.extend_from_slice(&header_bytes);

        for _ in 0..block_count {
            vhd.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        }
        while !vhd.len().is_multiple_of(512) {
            vhd.push(0);
        }
        vhd.extend_from_slice(&footer_bytes);
        vhd
    }

    #[cfg(unix)]
    #[test]
    fn second_exclusive_lock_on_same_vhd_fails() {
        let data = build_fixed(1024);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let first = VhdEngine::open(tmp.path(), false).unwrap();
        let second = VhdEngine::open(tmp.path(), false).unwrap();
        assert!(first.try_lock_exclusive().unwrap());
        assert!(!second.try_lock_exclusive().unwrap());
    }

    #[test]
    fn fixed_read_at_offset() {
        let data = build_fixed(1024);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), true).unwrap();
        assert_eq!(engine.len(), 1024);
        let mut buf = [0u8; 5];
        assert_eq!(engine.read_at(100, &mut buf).unwrap(), 5);
        assert_eq!(buf, [100, 101, 102, 103, 104]);
    }

    #[test]
    fn fixed_write_then_read_back() {
        let data = build_fixed(1024);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), false).unwrap();
        engine.write_at(10, &[9, 9, 9]).unwrap();
        let mut buf = [0u8; 3];
        engine.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9]);
    }

    #[test]
    fn dynamic_sparse_block_reads_as_zero() {
        let data = build_dynamic_all_sparse(16384, 4096);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), true).unwrap();
        assert!(engine.is_dynamic());
        let mut buf = [0xAAu8; 100];
        engine.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 100]);
    }

    #[test]
    fn dynamic_all_zero_write_to_sparse_block_stays_sparse() {
        let data = build_dynamic_all_sparse(16384, 4096);
        let original_len = data.len() as u64;
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), false).unwrap();
        let zeros = vec![0u8; 4096];
        engine.write_at(0, &zeros).unwrap();

        let grown_len = std::fs::metadata(tmp.path()).unwrap().len();
        assert_eq!(grown_len, original_len, "all-zero write must not allocate");
    }

    #[test]
    fn dynamic_nonzero_write_allocates_block_and_reads_back() {
        let data = build_dynamic_all_sparse(16384, 4096);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), false).unwrap();
        let payload: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        engine.write_at(0, &payload).unwrap();

        let mut buf = vec![0u8; 4096];
        engine.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, payload);

        // Neighboring sparse block is untouched.
        let mut neighbor = [0u8; 16];
        engine.read_at(4096, &mut neighbor).unwrap();
        assert_eq!(neighbor, [0u8; 16]);
    }

    #[test]
    fn dynamic_cross_block_write_and_read() {
        let data = build_dynamic_all_sparse(16384, 4096);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut engine = VhdEngine::open(tmp.path(), false).unwrap();
        let payload: Vec<u8> = (0..12u64).map(|i| (i + 1) as u8).collect();
        engine.write_at(4090, &payload).unwrap();

        let mut buf = vec![0u8; 12];
        engine.read_at(4090, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }
}
