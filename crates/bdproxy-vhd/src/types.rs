//! VHD footer, dynamic header, and Block Allocation Table layouts.
//!
//! Field layout and the one's-complement checksum follow the Microsoft VHD
//! Image Format Specification exactly: all multi-byte footer/header fields
//! are big-endian, the footer is a fixed 512 bytes, the dynamic header a
//! fixed 1024 bytes.

use bdproxy_core::Result;

/// VHD disk type, stored big-endian at footer offset 60.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VhdType {
    None = 0,
    Reserved1 = 1,
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
    Reserved5 = 5,
    Reserved6 = 6,
}

impl VhdType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(VhdType::None),
            1 => Ok(VhdType::Reserved1),
            2 => Ok(VhdType::Fixed),
            3 => Ok(VhdType::Dynamic),
            4 => Ok(VhdType::Differencing),
            5 => Ok(VhdType::Reserved5),
            6 => Ok(VhdType::Reserved6),
            _ => Err(bdproxy_core::Error::invalid_image(format!(
                "invalid VHD disk type: {value}"
            ))),
        }
    }
}

/// CHS disk geometry, stored at footer offset 56.
#[derive(Debug, Clone, Copy)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let cyl_bytes = self.cylinders.to_be_bytes();
        [cyl_bytes[0], cyl_bytes[1], self.heads, self.sectors]
    }

    /// Derive a CHS geometry from a size in bytes, using the algorithm from
    /// the VHD format spec (capped at 65535 cylinders, 255 heads).
    pub fn from_size(size_bytes: u64) -> Self {
        let total_sectors = (size_bytes / 512).min(65535u64 * 16 * 255);
        let (cylinders, heads, sectors_per_track) = if total_sectors >= 65535 * 16 * 63 {
            (65535u64, 16u64, 255u64)
        } else {
            let mut sectors_per_track = 17u64;
            let mut heads = 4u64;
            let mut cylinder_times_heads = total_sectors / sectors_per_track;

            if cylinder_times_heads >= heads * 1024 {
                sectors_per_track = 31;
                heads = 16;
                cylinder_times_heads = total_sectors / sectors_per_track;
            }
            if cylinder_times_heads >= heads * 1024 {
                sectors_per_track = 63;
                heads = 16;
                cylinder_times_heads = total_sectors / sectors_per_track;
            }
            while cylinder_times_heads >= heads * 1024 {
                heads *= 2;
                if heads > 255 {
                    heads = 255;
                    break;
                }
                cylinder_times_heads = total_sectors / sectors_per_track;
            }
            let cylinders = (cylinder_times_heads / heads).min(65535);
            (cylinders, heads, sectors_per_track)
        };
        Self {
            cylinders: cylinders as u16,
            heads: heads as u8,
            sectors: sectors_per_track as u8,
        }
    }
}

/// 512-byte VHD footer, present at the end of every VHD and (for dynamic
/// disks) mirrored at the very start of the file.
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub cookie: [u8; 8],
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: VhdType,
    pub checksum: u32,
    pub uuid: [u8; 16],
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

impl VhdFooter {
    pub const COOKIE: &'static [u8; 8] = b"conectix";
    pub const SIZE: usize = 512;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(bdproxy_core::Error::invalid_image("VHD footer too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if &cookie != Self::COOKIE {
            return Err(bdproxy_core::Error::SignatureVerification(format!(
                "invalid VHD footer cookie: expected 'conectix', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let features = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let version = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let data_offset = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let timestamp = u32::from_be_bytes(bytes[24..28].try_into().unwrap());

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);

        let creator_version = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let creator_os = u32::from_be_bytes(bytes[36..40].try_into().unwrap());
        let original_size = u64::from_be_bytes(bytes[40..48].try_into().unwrap());
        let current_size = u64::from_be_bytes(bytes[48..56].try_into().unwrap());
        let geometry = DiskGeometry::parse(&bytes[56..60]);
        let disk_type = VhdType::from_u32(u32::from_be_bytes(bytes[60..64].try_into().unwrap()))?;
        let checksum = u32::from_be_bytes(bytes[64..68].try_into().unwrap());

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[68..84]);
        let saved_state = bytes[84];

        let mut reserved = [0u8; 427];
        reserved.copy_from_slice(&bytes[85..512]);

        Ok(Self {
            cookie,
            features,
            version,
            data_offset,
            timestamp,
            creator_app,
            creator_version,
            creator_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            uuid,
            saved_state,
            reserved,
        })
    }

    /// One's complement of the sum of every footer byte, with the checksum
    /// field itself treated as zero.
    pub fn verify_checksum(&self) -> bool {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        let mut sum: u32 = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            if (64..68).contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(byte as u32);
        }
        !sum == self.checksum
    }

    /// Recompute and set `self.checksum` to match the current field values.
    /// Used after rewriting `current_size`/`data_offset` when a new block is
    /// allocated and the footer is relocated to the new end of file.
    pub fn recompute_checksum(&mut self) {
        self.checksum = 0;
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        let mut sum: u32 = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            if (64..68).contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(byte as u32);
        }
        self.checksum = !sum;
    }

    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        bytes[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[68..84].copy_from_slice(&self.uuid);
        bytes[84] = self.saved_state;
        bytes[85..512].copy_from_slice(&self.reserved);
    }
}

/// 1024-byte dynamic header, present only in dynamic/differencing VHDs at
/// `footer.data_offset`.
#[derive(Debug, Clone)]
pub struct VhdDynamicHeader {
    pub cookie: [u8; 8],
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
    pub reserved1: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locator_entries: [[u8; 24]; 8],
    pub reserved2: [u8; 256],
}

impl VhdDynamicHeader {
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";
    pub const SIZE: usize = 1024;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(bdproxy_core::Error::invalid_image(
                "VHD dynamic header too small",
            ));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if &cookie != Self::COOKIE {
            return Err(bdproxy_core::Error::SignatureVerification(format!(
                "invalid VHD dynamic header cookie: expected 'cxsparse', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let data_offset = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let table_offset = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let header_version = u32::from_be_bytes(bytes[24..28].try_into().unwrap());
        let max_table_entries = u32::from_be_bytes(bytes[28..32].try_into().unwrap());
        let block_size = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let checksum = u32::from_be_bytes(bytes[36..40].try_into().unwrap());

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&bytes[40..56]);
        let parent_timestamp = u32::from_be_bytes(bytes[56..60].try_into().unwrap());
        let reserved1 = u32::from_be_bytes(bytes[60..64].try_into().unwrap());

        let mut parent_unicode_name = [0u16; 256];
        for i in 0..256 {
            let offset = 64 + i * 2;
            parent_unicode_name[i] = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }

        let mut parent_locator_entries = [[0u8; 24]; 8];
        for i in 0..8 {
            let offset = 576 + i * 24;
            parent_locator_entries[i].copy_from_slice(&bytes[offset..offset + 24]);
        }

        let mut reserved2 = [0u8; 256];
        reserved2.copy_from_slice(&bytes[768..1024]);

        Ok(Self {
            cookie,
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            parent_uuid,
            parent_timestamp,
            reserved1,
            parent_unicode_name,
            parent_locator_entries,
            reserved2,
        })
    }

    pub fn verify_checksum(&self) -> bool {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        let mut sum: u32 = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            if (36..40).contains(&i) {
                continue;
            }
            sum = sum.wrapping_add(byte as u32);
        }
        !sum == self.checksum
    }

    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[40..56].copy_from_slice(&self.parent_uuid);
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        bytes[60..64].copy_from_slice(&self.reserved1.to_be_bytes());
        for i in 0..256 {
            let offset = 64 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&self.parent_unicode_name[i].to_be_bytes());
        }
        for i in 0..8 {
            let offset = 576 + i * 24;
            bytes[offset..offset + 24].copy_from_slice(&self.parent_locator_entries[i]);
        }
        bytes[768..1024].copy_from_slice(&self.reserved2);
    }
}

/// Sector offset meaning "this block is not yet allocated".
pub const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;

/// Block Allocation Table: one big-endian `u32` sector offset per block.
#[derive(Clone)]
pub struct BlockAllocationTable {
    pub entries: Vec<u32>,
}

impl BlockAllocationTable {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if !bytes.len().is_multiple_of(4) {
            return Err(bdproxy_core::Error::invalid_image(
                "BAT size must be a multiple of 4",
            ));
        }
        let entry_count = bytes.len() / 4;
        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let offset = i * 4;
            entries.push(u32::from_be_bytes(
                bytes[offset..offset + 4].try_into().unwrap(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn serialize_entry(value: u32) -> [u8; 4] {
        value.to_be_bytes()
    }

    /// Physical byte offset of block `block_index`'s data, or `None` if the
    /// block is still sparse.
    pub fn get_block_offset(&self, block_index: usize) -> Option<u64> {
        let entry = *self.entries.get(block_index)?;
        if entry == BAT_UNALLOCATED {
            None
        } else {
            Some((entry as u64) * 512)
        }
    }

    pub fn is_allocated(&self, block_index: usize) -> bool {
        self.entries
            .get(block_index)
            .is_some_and(|&e| e != BAT_UNALLOCATED)
    }

    pub fn set(&mut self, block_index: usize, sector: u32) {
        self.entries[block_index] = sector;
    }
}
