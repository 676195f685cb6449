//! Dynamic request/response buffer, shared across transports that own a
//! growable `Vec<u8>` (the socket transport; shm/driver transports instead
//! have a fixed mapped region and treat growth as a no-op once the OS has
//! granted a size, per spec).

use bdproxy_core::security::MAX_BUFFER_SIZE;

/// A buffer that only ever grows, clamped to [`MAX_BUFFER_SIZE`].
pub struct SessionBuffer {
    data: Vec<u8>,
}

impl SessionBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.min(MAX_BUFFER_SIZE)],
        }
    }

    /// Ensure the buffer is at least `len` bytes, growing (never shrinking)
    /// up to [`MAX_BUFFER_SIZE`]. Returns `false` if `len` exceeds the cap.
    pub fn ensure_len(&mut self, len: usize) -> bool {
        if len > MAX_BUFFER_SIZE {
            return false;
        }
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        true
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        &mut self.data[..len]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Default for SessionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_to_requested_length() {
        let mut buf = SessionBuffer::new();
        assert!(buf.ensure_len(4096));
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn never_shrinks() {
        let mut buf = SessionBuffer::with_capacity(8192);
        assert!(buf.ensure_len(100));
        assert_eq!(buf.capacity(), 8192);
    }

    #[test]
    fn rejects_growth_past_cap() {
        let mut buf = SessionBuffer::new();
        assert!(!buf.ensure_len(MAX_BUFFER_SIZE + 1));
    }
}
