//! MBR partition table parsing, including extended-partition (EBR chain)
//! resolution.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0x1BE   16    Partition entry 1
//! 0x1CE   16    Partition entry 2
//! 0x1DE   16    Partition entry 3
//! 0x1EE   16    Partition entry 4
//! 0x1FE   2     Boot signature (0x55 0xAA)
//! ```
//!
//! A primary entry of type `Extended`/`ExtendedLba` (0x05/0x0F) does not
//! name a partition itself; it points at the first Extended Boot Record
//! (EBR), a chain of further 512-byte sectors each holding one logical
//! partition plus (optionally) a pointer to the next EBR. The first
//! partition entry in an EBR is addressed relative to that EBR's own LBA;
//! the second (the "next EBR" pointer) is addressed relative to the first
//! EBR in the chain.

pub mod types;

use std::io::SeekFrom;

use bdproxy_core::{security::MAX_PARTITION_COUNT, Error, ReadSeek, Result};
use types::MbrPartitionType;

const MBR_SIZE: usize = 512;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const DISK_SIGNATURE_OFFSET: usize = 0x1B8;
const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
const PARTITION_ENTRY_SIZE: usize = 16;
const NUM_PARTITIONS: usize = 4;
const BOOT_SIGNATURE: u16 = 0xAA55;

/// One numbered, usable partition (primary or logical).
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    /// 1-based partition number, in the order a user would expect from
    /// `fdisk`-style tools: primaries in table order, then each logical
    /// partition in EBR chain order.
    pub number: usize,
    pub offset: u64,
    pub length: u64,
    pub partition_type: MbrPartitionType,
    pub bootable: bool,
}

/// A parsed MBR, including every logical partition reachable through an
/// extended partition's EBR chain.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
    disk_signature: u32,
}

struct RawEntry {
    bootable: bool,
    partition_type: MbrPartitionType,
    lba_start: u32,
    lba_length: u32,
}

fn parse_entry(bytes: &[u8]) -> Result<RawEntry> {
    let status = bytes[0];
    if status & 0x7F != 0 {
        return Err(Error::invalid_image(format!(
            "invalid partition status byte 0x{status:02X}"
        )));
    }
    Ok(RawEntry {
        bootable: status == 0x80,
        partition_type: MbrPartitionType::from_byte(bytes[4]),
        lba_start: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        lba_length: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
    })
}

fn read_sector(stream: &mut dyn ReadSeek, lba: u64, sector_size: u32) -> Result<[u8; MBR_SIZE]> {
    stream.seek(SeekFrom::Start(lba * sector_size as u64))?;
    let mut buf = [0u8; MBR_SIZE];
    stream.read_exact(&mut buf)?;
    if u16::from_le_bytes([buf[BOOT_SIGNATURE_OFFSET], buf[BOOT_SIGNATURE_OFFSET + 1]])
        != BOOT_SIGNATURE
    {
        return Err(Error::SignatureVerification(format!(
            "missing 0x55AA boot signature at LBA {lba}"
        )));
    }
    Ok(buf)
}

impl PartitionTable {
    /// Parse the MBR at the start of `stream` and walk any extended
    /// partition's EBR chain, numbering every usable partition in
    /// conventional order.
    pub fn parse(stream: &mut dyn ReadSeek, sector_size: u32) -> Result<Self> {
        bdproxy_core::security::validate_sector_size(sector_size)?;

        let mbr = read_sector(stream, 0, sector_size)?;
        let disk_signature = u32::from_le_bytes(
            mbr[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
                .try_into()
                .unwrap(),
        );

        let mut entries = Vec::new();
        let mut number = 0usize;
        let mut extended_start: Option<u64> = None;

        for i in 0..NUM_PARTITIONS {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            let raw = parse_entry(&mbr[offset..offset + PARTITION_ENTRY_SIZE])?;
            if raw.partition_type == MbrPartitionType::Empty || raw.lba_length == 0 {
                continue;
            }
            if raw.partition_type.is_extended() {
                if extended_start.is_some() {
                    return Err(Error::invalid_image(
                        "more than one extended partition in MBR",
                    ));
                }
                extended_start = Some(raw.lba_start as u64);
                continue;
            }
            number += 1;
            entries.push(PartitionEntry {
                number,
                offset: raw.lba_start as u64 * sector_size as u64,
                length: raw.lba_length as u64 * sector_size as u64,
                partition_type: raw.partition_type,
                bootable: raw.bootable,
            });
        }

        if let Some(first_ebr_lba) = extended_start {
            walk_ebr_chain(
                stream,
                sector_size,
                first_ebr_lba,
                &mut number,
                &mut entries,
            )?;
        }

        Ok(Self {
            entries,
            disk_signature,
        })
    }

    pub fn disk_signature(&self) -> u32 {
        self.disk_signature
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Look up a partition by its 1-based number.
    pub fn resolve(&self, number: usize) -> Result<&PartitionEntry> {
        self.entries
            .iter()
            .find(|e| e.number == number)
            .ok_or_else(|| Error::not_found(format!("partition {number} not found")))
    }

    /// A protective MBR (a single entry of type 0xEE spanning the disk)
    /// indicates the disk is actually GPT-partitioned.
    pub fn is_gpt_protective(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.partition_type == MbrPartitionType::GptProtective)
    }
}

fn walk_ebr_chain(
    stream: &mut dyn ReadSeek,
    sector_size: u32,
    first_ebr_lba: u64,
    number: &mut usize,
    entries: &mut Vec<PartitionEntry>,
) -> Result<()> {
    let mut next_ebr_lba = Some(first_ebr_lba);
    let mut iterations = 0usize;

    while let Some(ebr_lba) = next_ebr_lba {
        iterations += 1;
        if iterations > MAX_PARTITION_COUNT {
            return Err(Error::invalid_image(
                "extended partition chain exceeds maximum length (possible cycle)",
            ));
        }

        let ebr = read_sector(stream, ebr_lba, sector_size)?;

        let logical = parse_entry(
            &ebr[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + PARTITION_ENTRY_SIZE],
        )?;
        if logical.partition_type != MbrPartitionType::Empty && logical.lba_length != 0 {
            *number += 1;
            entries.push(PartitionEntry {
                number: *number,
                offset: (ebr_lba + logical.lba_start as u64) * sector_size as u64,
                length: logical.lba_length as u64 * sector_size as u64,
                partition_type: logical.partition_type,
                bootable: logical.bootable,
            });
        }

        let next_offset = PARTITION_TABLE_OFFSET + PARTITION_ENTRY_SIZE;
        let next = parse_entry(&ebr[next_offset..next_offset + PARTITION_ENTRY_SIZE])?;
        next_ebr_lba = if next.partition_type.is_extended() && next.lba_length != 0 {
            Some(first_ebr_lba + next.lba_start as u64)
        } else {
            None
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn set_entry(
        mbr: &mut [u8],
        entry_offset: usize,
        bootable: bool,
        partition_type: u8,
        lba_start: u32,
        lba_length: u32,
    ) {
        mbr[entry_offset] = if bootable { 0x80 } else { 0x00 };
        mbr[entry_offset + 4] = partition_type;
        mbr[entry_offset + 8..entry_offset + 12].copy_from_slice(&lba_start.to_le_bytes());
        mbr[entry_offset + 12..entry_offset + 16].copy_from_slice(&lba_length.to_le_bytes());
    }

    fn blank_sector_with_signature() -> Vec<u8> {
        let mut sector = vec![0u8; MBR_SIZE];
        sector[BOOT_SIGNATURE_OFFSET] = 0x55;
        sector[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
        sector
    }

    #[test]
    fn parses_single_primary_partition() {
        let mut mbr = blank_sector_with_signature();
        mbr[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&0x78563412u32.to_le_bytes());
        set_entry(&mut mbr, PARTITION_TABLE_OFFSET, true, 0x0C, 2048, 2048);

        let mut cursor = Cursor::new(mbr);
        let table = PartitionTable::parse(&mut cursor, 512).unwrap();

        assert_eq!(table.disk_signature(), 0x78563412);
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.entries()[0].number, 1);
        assert_eq!(table.entries()[0].offset, 2048 * 512);
        assert_eq!(table.entries()[0].length, 2048 * 512);
        assert!(table.entries()[0].bootable);
    }

    #[test]
    fn rejects_missing_boot_signature() {
        let mbr = vec![0u8; MBR_SIZE];
        let mut cursor = Cursor::new(mbr);
        assert!(PartitionTable::parse(&mut cursor, 512).is_err());
    }

    #[test]
    fn empty_table_has_no_entries() {
        let mbr = blank_sector_with_signature();
        let mut cursor = Cursor::new(mbr);
        let table = PartitionTable::parse(&mut cursor, 512).unwrap();
        assert!(table.entries().is_empty());
    }

    #[test]
    fn detects_gpt_protective() {
        let mut mbr = blank_sector_with_signature();
        set_entry(&mut mbr, PARTITION_TABLE_OFFSET, false, 0xEE, 1, 0xFFFFFFFF);
        let mut cursor = Cursor::new(mbr);
        let table = PartitionTable::parse(&mut cursor, 512).unwrap();
        assert!(table.is_gpt_protective());
    }

    #[test]
    fn walks_extended_partition_chain() {
        // Primary 1: a plain FAT32 partition at LBA 63, 1000 sectors.
        // Primary 2: extended container starting at LBA 2048.
        let mut mbr = blank_sector_with_signature();
        set_entry(&mut mbr, PARTITION_TABLE_OFFSET, false, 0x0C, 63, 1000);
        set_entry(
            &mut mbr,
            PARTITION_TABLE_OFFSET + PARTITION_ENTRY_SIZE,
            false,
            0x05,
            2048,
            4096,
        );

        // EBR #1 at LBA 2048: one logical partition at +63 relative to this
        // EBR, plus a pointer to EBR #2 at +2048 relative to the *first*
        // EBR (i.e. absolute LBA 4096).
        let mut ebr1 = blank_sector_with_signature();
        set_entry(&mut ebr1, PARTITION_TABLE_OFFSET, false, 0x83, 63, 500);
        set_entry(
            &mut ebr1,
            PARTITION_TABLE_OFFSET + PARTITION_ENTRY_SIZE,
            false,
            0x05,
            2048,
            2048,
        );

        // EBR #2 at absolute LBA 4096: one logical partition, no further link.
        let mut ebr2 = blank_sector_with_signature();
        set_entry(&mut ebr2, PARTITION_TABLE_OFFSET, false, 0x82, 63, 200);

        let mut disk = vec![0u8; 4096 * 512 + MBR_SIZE];
        disk[0..MBR_SIZE].copy_from_slice(&mbr);
        disk[2048 * 512..2048 * 512 + MBR_SIZE].copy_from_slice(&ebr1);
        disk[4096 * 512..4096 * 512 + MBR_SIZE].copy_from_slice(&ebr2);

        let mut cursor = Cursor::new(disk);
        let table = PartitionTable::parse(&mut cursor, 512).unwrap();

        assert_eq!(table.entries().len(), 3);
        assert_eq!(table.entries()[0].number, 1);
        assert_eq!(table.entries()[0].offset, 63 * 512);
        assert_eq!(table.entries()[1].number, 2);
        assert_eq!(table.entries()[1].offset, (2048 + 63) * 512);
        assert_eq!(table.entries()[2].number, 3);
        assert_eq!(table.entries()[2].offset, (4096 + 63) * 512);

        assert_eq!(table.resolve(2).unwrap().offset, (2048 + 63) * 512);
        assert!(table.resolve(99).is_err());
    }

    #[test]
    fn rejects_malformed_status_byte() {
        let mut mbr = blank_sector_with_signature();
        mbr[PARTITION_TABLE_OFFSET] = 0x42; // neither 0x00 nor 0x80
        mbr[PARTITION_TABLE_OFFSET + 4] = 0x0C;
        mbr[PARTITION_TABLE_OFFSET + 12] = 0x01;
        let mut cursor = Cursor::new(mbr);
        assert!(PartitionTable::parse(&mut cursor, 512).is_err());
    }
}
