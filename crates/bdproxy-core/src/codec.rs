//! Fixed-width endian helpers shared by the VHD, MBR, and wire-protocol codecs.
//!
//! Free functions rather than a generic serialization trait: every caller
//! here wants a specific width and a specific byte order for a specific
//! field, not a generic `Serialize` impl.

/// Read a big-endian `u32` from the start of `buf`.
pub fn read_u32_be(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().expect("4-byte slice"))
}

/// Read a big-endian `u64` from the start of `buf`.
pub fn read_u64_be(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().expect("8-byte slice"))
}

/// Write a `u32` to `buf` in big-endian order.
pub fn write_u32_be(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_be_bytes());
}

/// Write a `u64` to `buf` in big-endian order.
pub fn write_u64_be(buf: &mut [u8], value: u64) {
    buf[..8].copy_from_slice(&value.to_be_bytes());
}

/// Read a little-endian `u32` from the start of `buf`.
pub fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice"))
}

/// Read a little-endian `u64` from the start of `buf`.
pub fn read_u64_le(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"))
}

/// Write a `u32` to `buf` in little-endian order.
pub fn write_u32_le(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_le_bytes());
}

/// Write a `u64` to `buf` in little-endian order.
pub fn write_u64_le(buf: &mut [u8], value: u64) {
    buf[..8].copy_from_slice(&value.to_le_bytes());
}

/// One's-complement checksum used by the VHD footer and dynamic header: the
/// sum of every byte in `data`, inverted. Callers zero the checksum field
/// itself before calling this.
pub fn ones_complement_checksum(data: &[u8]) -> u32 {
    let sum: u32 = data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    !sum
}

/// Number of bits needed to represent `n` as `1 << shift`, i.e. `log2(n)`
/// for a power-of-two `n`. Used to turn a VHD block size or sector size
/// into a shift amount once at open time.
pub fn shift_for_power_of_two(n: u32) -> Option<u32> {
    if n == 0 || !n.is_power_of_two() {
        return None;
    }
    Some(n.trailing_zeros())
}
