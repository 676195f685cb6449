//! Size-limit constants and overflow-safe arithmetic helpers.
//!
//! A peer or a corrupt image can claim sizes far larger than the data that
//! actually follows (an oversized BAT, a bogus partition length, an
//! oversized read/write request). These helpers keep that arithmetic from
//! overflowing or turning into an unbounded allocation.

use crate::Error;

/// Largest sector size accepted from a partition table or VHD footer.
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Largest single buffer this process will allocate for one request
/// (clamped well below the `isize::MAX / 2` ceiling used for dynamic
/// buffer growth, see [`MAX_BUFFER_SIZE`]).
pub const MAX_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;

/// Ceiling for the transport's dynamic request/response buffer. Growth is
/// monotone and never exceeds this.
pub const MAX_BUFFER_SIZE: usize = (isize::MAX as usize) / 2;

/// Largest Block Allocation Table this process will load into memory.
pub const MAX_BAT_SIZE: usize = 64 * 1024 * 1024;

/// Largest partition count accepted while walking an MBR/EBR chain
/// (guards against a maliciously or accidentally circular EBR chain).
pub const MAX_PARTITION_COUNT: usize = 256;

/// Largest backing-file size this process will memory-map in one piece.
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Validate that a claimed size fits within `limit`, returning it as `usize`.
pub fn validate_allocation_size(size: u64, limit: usize, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(Error::limit_exceeded(format!(
            "{context} size {size} exceeds limit {limit}"
        )));
    }
    size.try_into()
        .map_err(|_| Error::limit_exceeded(format!("{context} size exceeds platform limits")))
}

/// Multiply two `u64`s, rejecting overflow.
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::limit_exceeded(format!("{context}: multiplication overflow")))
}

/// Multiply two `u32`s widened to `u64`, rejecting overflow.
pub fn checked_multiply_u32_to_u64(a: u32, b: u32, context: &str) -> crate::Result<u64> {
    (a as u64)
        .checked_mul(b as u64)
        .ok_or_else(|| Error::limit_exceeded(format!("{context}: multiplication overflow")))
}

/// Add two `u64` offsets, rejecting overflow (used for `offset + length` bounds checks).
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Error::limit_exceeded(format!("{context}: addition overflow")))
}

/// Convert a `u64` to `usize`, rejecting truncation on 32-bit targets.
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value
        .try_into()
        .map_err(|_| Error::limit_exceeded(format!("{context}: value {value} exceeds usize")))
}

/// A sector size must be nonzero, a power of two, and no larger than [`MAX_SECTOR_SIZE`].
pub fn validate_sector_size(sector_size: u32) -> crate::Result<()> {
    if sector_size == 0 || sector_size > MAX_SECTOR_SIZE {
        return Err(Error::invalid_image(format!(
            "invalid sector size: {sector_size} (must be 1-{MAX_SECTOR_SIZE})"
        )));
    }
    if !sector_size.is_power_of_two() {
        return Err(Error::invalid_image(format!(
            "sector size {sector_size} is not a power of two"
        )));
    }
    Ok(())
}

/// A partition/zone index must be strictly less than the enumerated count.
pub fn validate_partition_index(index: usize, max: usize) -> crate::Result<()> {
    if index >= max {
        return Err(Error::not_found(format!(
            "partition index {index} out of range (0-{})",
            max.saturating_sub(1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_size_within_limit() {
        assert!(validate_allocation_size(1024, MAX_ALLOCATION_SIZE, "test").is_ok());
    }

    #[test]
    fn allocation_size_over_limit_rejected() {
        assert!(
            validate_allocation_size(MAX_ALLOCATION_SIZE as u64 + 1, MAX_ALLOCATION_SIZE, "test")
                .is_err()
        );
    }

    #[test]
    fn checked_multiply_detects_overflow() {
        assert_eq!(checked_multiply_u64(1000, 512, "test").unwrap(), 512_000);
        assert!(checked_multiply_u64(u64::MAX, 2, "test").is_err());
    }

    #[test]
    fn checked_add_detects_overflow() {
        assert_eq!(checked_add_u64(10, 20, "test").unwrap(), 30);
        assert!(checked_add_u64(u64::MAX, 1, "test").is_err());
    }

    #[test]
    fn sector_size_validation() {
        assert!(validate_sector_size(512).is_ok());
        assert!(validate_sector_size(4096).is_ok());
        assert!(validate_sector_size(0).is_err());
        assert!(validate_sector_size(5000).is_err());
        assert!(validate_sector_size(1000).is_err());
    }

    #[test]
    fn partition_index_bounds() {
        assert!(validate_partition_index(0, 4).is_ok());
        assert!(validate_partition_index(3, 4).is_ok());
        assert!(validate_partition_index(4, 4).is_err());
    }
}
