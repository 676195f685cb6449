//! A backing store over a plain host file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use bdproxy_core::Result;

use crate::BackingStore;

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};

/// `O_SYNC`, requested best-effort so writes are durable without an
/// explicit `fsync` per request — matches the spec's "when supported"
/// wording; silently ignored on platforms/filesystems that reject it.
#[cfg(unix)]
const SYNC_FLAG: i32 = libc::O_SYNC;

pub struct FileStore {
    file: File,
    len: u64,
    read_only: bool,
}

impl FileStore {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);

        #[cfg(unix)]
        {
            if !read_only {
                options.custom_flags(SYNC_FLAG);
            }
        }

        let file = options.open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            read_only,
        })
    }

    /// Attempts to take an exclusive advisory lock on the whole backing
    /// file, standing in for "dismount the volume for write" on a host
    /// that has no mounted-volume concept of its own: a plain file has no
    /// volume to dismount, but a second process already holding it open for
    /// write is exactly the condition that check exists to catch. Returns
    /// `Ok(false)` (not an error) when someone else already holds the lock.
    #[cfg(unix)]
    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            Ok(true)
        } else {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(false),
                _ => Err(err),
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
        // SAFETY: `handle` is valid for the lifetime of `self.file`; `overlapped`
        // is zero-initialized as the API requires for a non-async lock range.
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
}

#[cfg(unix)]
impl BackingStore for FileStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "backing store is read-only",
            ));
        }
        self.file.write_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(not(unix))]
impl BackingStore for FileStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "backing store is read-only",
            ));
        }
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write(buf)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
