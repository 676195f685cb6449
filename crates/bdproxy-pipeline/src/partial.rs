//! A bounded, offset-addressed window into a backing stream.
//!
//! Presents a partition (or any other byte range of a disk image) as its
//! own zero-based address space. Re-expressed with `read_at`/`write_at`
//! rather than a persistent seek cursor: the wire protocol this window
//! ultimately serves is request/response, offset-addressed, with no notion
//! of a client "session position".

use std::io;

use bdproxy_core::security::checked_add_u64;
use bdproxy_core::OffsetStore;

/// A window of `length` bytes starting at `start` within `inner`.
pub struct PartialPipeline<T> {
    inner: T,
    start: u64,
    length: u64,
}

impl<T> PartialPipeline<T> {
    pub fn new(inner: T, start: u64, length: u64) -> Self {
        Self {
            inner,
            start,
            length,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Clip `(offset, len)` to the window, returning the absolute offset
    /// into `inner` and the clipped length (`0` once `offset` reaches the
    /// end of the window).
    fn clip(&self, offset: u64, len: usize) -> io::Result<(u64, usize)> {
        if offset >= self.length {
            return Ok((0, 0));
        }
        let remaining = self.length - offset;
        let clipped = (len as u64).min(remaining) as usize;
        let absolute = checked_add_u64(self.start, offset, "partial pipeline offset")
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok((absolute, clipped))
    }
}

impl<T: OffsetStore> PartialPipeline<T> {
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let (absolute, clipped) = self.clip(offset, buf.len())?;
        if clipped == 0 {
            return Ok(0);
        }
        self.inner.read_at(absolute, &mut buf[..clipped])
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let (absolute, clipped) = self.clip(offset, buf.len())?;
        if clipped == 0 {
            return Ok(0);
        }
        self.inner.write_at(absolute, &buf[..clipped])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory `OffsetStore`, standing in for `VhdEngine`/
    /// `Box<dyn BackingStore>` in these tests (neither of which this crate
    /// can construct, and `Cursor<Vec<u8>>` can't implement a foreign trait
    /// from here).
    struct VecStore(Vec<u8>);

    impl OffsetStore for VecStore {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let start = offset as usize;
            if start >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
            let start = offset as usize;
            let end = start + buf.len();
            if end > self.0.len() {
                self.0.resize(end, 0);
            }
            self.0[start..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn backing() -> VecStore {
        VecStore((0..100u32).map(|n| n as u8).collect())
    }

    #[test]
    fn reads_within_window() {
        let mut partial = PartialPipeline::new(backing(), 20, 10);
        let mut buf = [0u8; 5];
        assert_eq!(partial.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(buf, [20, 21, 22, 23, 24]);
    }

    #[test]
    fn read_clips_at_window_end() {
        let mut partial = PartialPipeline::new(backing(), 20, 10);
        let mut buf = [0u8; 20];
        assert_eq!(partial.read_at(5, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[25, 26, 27, 28, 29]);
    }

    #[test]
    fn read_past_end_returns_zero() {
        let mut partial = PartialPipeline::new(backing(), 20, 10);
        let mut buf = [0u8; 5];
        assert_eq!(partial.read_at(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_within_window_is_offset_by_start() {
        let mut partial = PartialPipeline::new(backing(), 20, 10);
        partial.write_at(2, &[0xAA, 0xBB]).unwrap();
        let mut buf = [0u8; 2];
        partial.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }

    #[test]
    fn write_clips_at_window_end() {
        let mut partial = PartialPipeline::new(backing(), 95, 5);
        let n = partial.write_at(2, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(n, 3);
    }
}
