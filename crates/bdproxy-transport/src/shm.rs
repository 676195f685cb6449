//! Shared-memory transport: a mapped region plus two single-wakeup
//! signals (request/response) and a "second server instance" guard,
//! filling the same three IPC roles on every platform even though the
//! underlying primitives differ — the same platform-split pattern the
//! pack's Gladix `memory_ring` reader uses for its brokered section
//! (Win32 object on one platform, the natural POSIX equivalent on the
//! other), generalized here from "kernel-driver-brokered handle" to
//! "two independent OS primitive families implementing one IPC role".

use crate::error::{Result, TransportError};

#[cfg(windows)]
pub use windows_impl::ShmTransport;

#[cfg(unix)]
pub use unix_impl::ShmTransport;

pub struct ShmStream<'a, T> {
    pub(crate) inner: &'a mut T,
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::io::{self, Read, Write};
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE};
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
        PAGE_READWRITE,
    };
    use windows_sys::Win32::System::Threading::{
        CreateEventW, CreateMutexW, ReleaseMutex, WaitForSingleObject, INFINITE,
    };

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Win32-backed exchange region: a named file mapping, two auto-reset
    /// events (`<name>_Request`/`<name>_Response`), and a named mutex
    /// (`<name>_Server`) whose creation fails with `ERROR_ALREADY_EXISTS`
    /// if another server instance is already bound to this name.
    pub struct ShmTransport {
        mapping: HANDLE,
        view: *mut u8,
        buffer_size: usize,
        request_event: HANDLE,
        response_event: HANDLE,
        server_mutex: HANDLE,
        served: bool,
        read_pos: usize,
        write_pos: usize,
        /// Set once a response has been flushed (or at construction); the
        /// next `read` must first wait for the client's next request
        /// before the cursors are valid again.
        awaiting_request: bool,
    }

    unsafe impl Send for ShmTransport {}

    impl ShmTransport {
        pub fn create(name: &str, buffer_size: usize) -> Result<Self> {
            // SAFETY: all handles below are checked for null/failure before use.
            unsafe {
                let mutex_name = wide(&format!("{name}_Server"));
                let server_mutex = CreateMutexW(ptr::null(), 1, mutex_name.as_ptr());
                if server_mutex == 0 {
                    return Err(TransportError::Setup(format!(
                        "CreateMutexW failed: {}",
                        io::Error::last_os_error()
                    )));
                }
                if GetLastError() == ERROR_ALREADY_EXISTS {
                    CloseHandle(server_mutex);
                    return Err(TransportError::AlreadyRunning);
                }

                let mapping = CreateFileMappingW(
                    HANDLE_INVALID_VALUE,
                    ptr::null(),
                    PAGE_READWRITE,
                    0,
                    buffer_size as u32,
                    wide(name).as_ptr(),
                );
                if mapping == 0 {
                    CloseHandle(server_mutex);
                    return Err(TransportError::Setup(format!(
                        "CreateFileMappingW failed: {}",
                        io::Error::last_os_error()
                    )));
                }

                let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, buffer_size) as *mut u8;
                if view.is_null() {
                    CloseHandle(mapping);
                    CloseHandle(server_mutex);
                    return Err(TransportError::Setup(format!(
                        "MapViewOfFile failed: {}",
                        io::Error::last_os_error()
                    )));
                }

                let request_event =
                    CreateEventW(ptr::null(), 0, 0, wide(&format!("{name}_Request")).as_ptr());
                let response_event =
                    CreateEventW(ptr::null(), 0, 0, wide(&format!("{name}_Response")).as_ptr());
                if request_event == 0 || response_event == 0 {
                    UnmapViewOfFile(view as *const _);
                    CloseHandle(mapping);
                    CloseHandle(server_mutex);
                    return Err(TransportError::Setup(format!(
                        "CreateEventW failed: {}",
                        io::Error::last_os_error()
                    )));
                }

                Ok(Self {
                    mapping,
                    view,
                    buffer_size,
                    request_event,
                    response_event,
                    server_mutex,
                    served: false,
                    read_pos: 0,
                    write_pos: 0,
                    awaiting_request: true,
                })
            }
        }

        pub fn accept(&mut self) -> Result<ShmStream<'_, Self>> {
            if self.served {
                return Err(TransportError::Setup(
                    "shared-memory transport already served its one session".into(),
                ));
            }
            self.served = true;
            Ok(ShmStream { inner: self })
        }

        fn region(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.view, self.buffer_size) }
        }

        fn region_mut(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.view, self.buffer_size) }
        }
    }

    impl Read for ShmTransport {
        /// One logical request (code, header, and any write payload) is read
        /// across several calls to this method without the client signaling
        /// again in between; the region cursor only resets when a new
        /// request actually arrives.
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.awaiting_request {
                unsafe {
                    WaitForSingleObject(self.request_event, INFINITE);
                }
                self.awaiting_request = false;
                self.read_pos = 0;
                self.write_pos = 0;
            }
            let available = self.buffer_size.saturating_sub(self.read_pos);
            let n = buf.len().min(available);
            buf[..n].copy_from_slice(&self.region()[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Write for ShmTransport {
        /// Accumulates into the region at the write cursor without
        /// signaling; a response built from several `write_all` calls (a
        /// header, then data) must land in the region as one contiguous
        /// write before the client is woken.
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let available = self.buffer_size.saturating_sub(self.write_pos);
            let n = buf.len().min(available);
            self.region_mut()[self.write_pos..self.write_pos + n].copy_from_slice(&buf[..n]);
            self.write_pos += n;
            Ok(n)
        }

        /// The response is complete: signal the client and arm the next
        /// `read` to wait for its next request.
        fn flush(&mut self) -> io::Result<()> {
            unsafe {
                windows_sys::Win32::System::Threading::SetEvent(self.response_event);
            }
            self.write_pos = 0;
            self.awaiting_request = true;
            Ok(())
        }
    }

    impl<'a> Read for ShmStream<'a, ShmTransport> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<'a> Write for ShmStream<'a, ShmTransport> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Drop for ShmTransport {
        fn drop(&mut self) {
            unsafe {
                UnmapViewOfFile(self.view as *const _);
                CloseHandle(self.mapping);
                CloseHandle(self.request_event);
                CloseHandle(self.response_event);
                ReleaseMutex(self.server_mutex);
                CloseHandle(self.server_mutex);
            }
        }
    }

    const HANDLE_INVALID_VALUE: HANDLE = -1i32 as isize as HANDLE;
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::io::{self, Read, Write};
    use std::os::unix::io::AsRawFd;

    use memmap2::MmapMut;

    /// POSIX equivalent of the Win32 exchange region: a `memmap2`-mapped
    /// file under `/dev/shm/<name>` for the region, two named semaphores
    /// standing in for the auto-reset request/response events
    /// (`sem_wait`/`sem_post` give the same single-wakeup semantics), and
    /// `flock(LOCK_EX | LOCK_NB)` on a sibling lock file standing in for
    /// the named mutex's "second instance fails" behavior.
    pub struct ShmTransport {
        mmap: MmapMut,
        lock_file: std::fs::File,
        request_sem: *mut libc::sem_t,
        response_sem: *mut libc::sem_t,
        served: bool,
        read_pos: usize,
        write_pos: usize,
        /// Set once a response has been flushed (or at construction); the
        /// next `read` must first wait for the client's next request
        /// before the cursors are valid again.
        awaiting_request: bool,
    }

    unsafe impl Send for ShmTransport {}

    impl ShmTransport {
        pub fn create(name: &str, buffer_size: usize) -> Result<Self> {
            let region_path = format!("/dev/shm/{name}");
            let lock_path = format!("/dev/shm/{name}.lock");

            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            // SAFETY: a valid, open file descriptor.
            let lock_rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if lock_rc != 0 {
                return Err(TransportError::AlreadyRunning);
            }

            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&region_path)?;
            file.set_len(buffer_size as u64)?;
            // SAFETY: `file` is open for read+write and sized above.
            let mmap = unsafe { MmapMut::map_mut(&file)? };

            let request_sem = open_semaphore(&format!("{name}_request"))?;
            let response_sem = open_semaphore(&format!("{name}_response"))?;

            Ok(Self {
                mmap,
                lock_file,
                request_sem,
                response_sem,
                served: false,
                read_pos: 0,
                write_pos: 0,
                awaiting_request: true,
            })
        }

        pub fn accept(&mut self) -> Result<ShmStream<'_, Self>> {
            if self.served {
                return Err(TransportError::Setup(
                    "shared-memory transport already served its one session".into(),
                ));
            }
            self.served = true;
            Ok(ShmStream { inner: self })
        }
    }

    fn open_semaphore(name: &str) -> Result<*mut libc::sem_t> {
        let cname = CString::new(format!("/{name}"))
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        // SAFETY: `cname` is a valid, nul-terminated C string.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600, 0) };
        if sem == libc::SEM_FAILED {
            return Err(TransportError::Setup(format!(
                "sem_open failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(sem)
    }

    impl Read for ShmTransport {
        /// One logical request (code, header, and any write payload) is read
        /// across several calls to this method without the client posting
        /// again in between; the region cursor only resets when a new
        /// request actually arrives.
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.awaiting_request {
                // SAFETY: `request_sem` was returned by `sem_open` and is
                // live for the lifetime of `self`.
                unsafe {
                    libc::sem_wait(self.request_sem);
                }
                self.awaiting_request = false;
                self.read_pos = 0;
                self.write_pos = 0;
            }
            let available = self.mmap.len().saturating_sub(self.read_pos);
            let n = buf.len().min(available);
            buf[..n].copy_from_slice(&self.mmap[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Write for ShmTransport {
        /// Accumulates into the region at the write cursor without posting;
        /// a response built from several `write_all` calls (a header, then
        /// data) must land in the region as one contiguous write before the
        /// client is woken.
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let available = self.mmap.len().saturating_sub(self.write_pos);
            let n = buf.len().min(available);
            self.mmap[self.write_pos..self.write_pos + n].copy_from_slice(&buf[..n]);
            self.write_pos += n;
            Ok(n)
        }

        /// The response is complete: post the semaphore and arm the next
        /// `read` to wait for its next request.
        fn flush(&mut self) -> io::Result<()> {
            self.mmap.flush()?;
            // SAFETY: `response_sem` is live for the lifetime of `self`.
            unsafe {
                libc::sem_post(self.response_sem);
            }
            self.write_pos = 0;
            self.awaiting_request = true;
            Ok(())
        }
    }

    impl<'a> Read for ShmStream<'a, ShmTransport> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<'a> Write for ShmStream<'a, ShmTransport> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Drop for ShmTransport {
        fn drop(&mut self) {
            // SAFETY: both semaphores were returned by `sem_open` in `create`.
            unsafe {
                libc::sem_close(self.request_sem);
                libc::sem_close(self.response_sem);
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(not(any(windows, unix)))]
pub struct ShmTransport;

#[cfg(not(any(windows, unix)))]
impl ShmTransport {
    pub fn create(_name: &str, _buffer_size: usize) -> Result<Self> {
        Err(TransportError::Unsupported(
            "shared-memory transport has no implementation for this platform".into(),
        ))
    }
}
