//! MBR partition table parsing, including extended/EBR chain resolution.
//!
//! GPT is out of scope: the proxy only ever resolves legacy MBR partition
//! numbers (`PartitionTable::is_gpt_protective` lets a caller reject a GPT
//! disk with a clear error instead of silently misreading it).

pub mod mbr;

pub use mbr::types::MbrPartitionType;
pub use mbr::{PartitionEntry, PartitionTable};
