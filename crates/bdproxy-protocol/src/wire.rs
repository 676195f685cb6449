//! Fixed-width wire structs for the INFO/READ/WRITE request/response
//! protocol, little-endian throughout.
//!
//! Every development and target platform for this crate is little-endian,
//! so the wire format is fixed as LE rather than branching on host
//! endianness at runtime — a deliberate simplification, not an oversight.

use std::io;

use bdproxy_core::codec::{read_u64_le, write_u64_le};

/// Matches the `IMDPROXY_REQ_*` constants observed in the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum RequestCode {
    Info = 0,
    Read = 1,
    Write = 2,
}

impl RequestCode {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Info),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

pub const DEVICE_INFO_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub file_size: u64,
    pub req_alignment: u64,
    pub flags: u64,
}

impl DeviceInfo {
    pub const FLAG_READ_ONLY: u64 = 1;

    pub fn serialize(&self) -> [u8; DEVICE_INFO_SIZE] {
        let mut out = [0u8; DEVICE_INFO_SIZE];
        write_u64_le(&mut out[0..8], self.file_size);
        write_u64_le(&mut out[8..16], self.req_alignment);
        write_u64_le(&mut out[16..24], self.flags);
        out
    }
}

pub const RW_REQUEST_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwRequest {
    pub offset: u64,
    pub length: u64,
}

impl RwRequest {
    pub fn parse(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < RW_REQUEST_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated read/write request header",
            ));
        }
        Ok(Self {
            offset: read_u64_le(&bytes[0..8]),
            length: read_u64_le(&bytes[8..16]),
        })
    }
}

pub const RESPONSE_HEADER_SIZE: usize = 16;

/// Shared header shape for both read and write responses: an errno
/// (0 = success) followed by the count of bytes actually transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub errno: u64,
    pub length: u64,
}

impl ResponseHeader {
    pub fn serialize(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        write_u64_le(&mut out[0..8], self.errno);
        write_u64_le(&mut out[8..16], self.length);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_code_round_trip() {
        assert_eq!(RequestCode::from_u64(0), Some(RequestCode::Info));
        assert_eq!(RequestCode::from_u64(1), Some(RequestCode::Read));
        assert_eq!(RequestCode::from_u64(2), Some(RequestCode::Write));
        assert_eq!(RequestCode::from_u64(99), None);
    }

    #[test]
    fn device_info_serializes_little_endian() {
        let info = DeviceInfo {
            file_size: 0x1000,
            req_alignment: 512,
            flags: 0,
        };
        let bytes = info.serialize();
        assert_eq!(&bytes[0..8], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &512u64.to_le_bytes());
    }

    #[test]
    fn rw_request_parses() {
        let mut bytes = [0u8; RW_REQUEST_SIZE];
        bytes[0..8].copy_from_slice(&100u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&200u64.to_le_bytes());
        let req = RwRequest::parse(&bytes).unwrap();
        assert_eq!(req.offset, 100);
        assert_eq!(req.length, 200);
    }

    #[test]
    fn rw_request_rejects_truncated_bytes() {
        assert!(RwRequest::parse(&[0u8; 8]).is_err());
    }

    #[test]
    fn response_header_serializes() {
        let header = ResponseHeader {
            errno: 0,
            length: 512,
        };
        let bytes = header.serialize();
        assert_eq!(&bytes[0..8], &0u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &512u64.to_le_bytes());
    }
}
