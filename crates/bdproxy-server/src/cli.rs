//! Argument parsing for the `devio`-style invocation grammar:
//! `bdproxy [--dll=lib;entry] [--drv] [--novhd] [-r] <comm> <image> [size|partno] [offset] [alignment] [bufsize]`
//!
//! Hand-rolled rather than built on a derive-based argument parser: the
//! grammar mixes flags, an overloaded positional (a size with a suffix, a
//! bare block count, or a small integer meaning "partition number"), and
//! several further positionals whose meaning depends on what came before —
//! not a good fit for a declarative argument-parsing crate, and the
//! original CLI this mirrors is itself a thin hand-written `getopt`-style
//! loop.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeOrPartNo {
    /// An explicit size in bytes for a backing store that doesn't already
    /// know its own length (a plugin, or a raw block device).
    Size(u64),
    /// A 1-based partition number to resolve against the image's MBR.
    PartitionNumber(usize),
}

#[derive(Debug, Clone)]
pub struct Args {
    pub dll: Option<String>,
    pub use_driver: bool,
    pub no_vhd: bool,
    pub read_only: bool,
    pub comm: String,
    pub image: PathBuf,
    pub size_or_partno: Option<SizeOrPartNo>,
    pub offset: Option<u64>,
    pub alignment: Option<u64>,
    pub bufsize: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("{0}")]
    Message(String),
}

pub fn parse(argv: &[String]) -> Result<Args, UsageError> {
    let mut dll = None;
    let mut use_driver = false;
    let mut no_vhd = false;
    let mut read_only = false;
    let mut positionals = Vec::new();

    for arg in argv {
        if let Some(spec) = arg.strip_prefix("--dll=") {
            dll = Some(spec.to_string());
        } else if arg == "--drv" {
            use_driver = true;
        } else if arg == "--novhd" {
            no_vhd = true;
        } else if arg == "-r" {
            read_only = true;
        } else if arg.starts_with('-') && arg != "-" {
            return Err(UsageError::Message(format!("unrecognized option '{arg}'")));
        } else {
            positionals.push(arg.clone());
        }
    }

    if positionals.len() < 2 {
        return Err(UsageError::Message(
            "usage: bdproxy [--dll=lib;entry] [--drv] [--novhd] [-r] <comm> <image> [size|partno] [offset] [alignment] [bufsize]".into(),
        ));
    }

    let comm = positionals.remove(0);
    let image = PathBuf::from(positionals.remove(0));

    let size_or_partno = positionals
        .first()
        .map(|s| parse_size_or_partno(s))
        .transpose()?;
    let offset = positionals
        .get(1)
        .map(|s| parse_size(s))
        .transpose()?;
    let alignment = positionals
        .get(2)
        .map(|s| parse_size(s))
        .transpose()?;
    let bufsize = positionals
        .get(3)
        .map(|s| parse_size(s).map(|v| v as usize))
        .transpose()?;

    Ok(Args {
        dll,
        use_driver,
        no_vhd,
        read_only,
        comm,
        image,
        size_or_partno,
        offset,
        alignment,
        bufsize,
    })
}

/// `B/K/M/G/T` are binary (1024-based), `b/k/m/g/t` are decimal
/// (1000-based), a bare number is a count of 512-byte blocks, and a bare
/// number less than 512 is instead a partition number (too small to be a
/// meaningful block count, matching the original's overload).
fn parse_size_or_partno(s: &str) -> Result<SizeOrPartNo, UsageError> {
    if split_suffix(s).is_some() {
        return Ok(SizeOrPartNo::Size(parse_size(s)?));
    }
    let value: u64 = s
        .parse()
        .map_err(|_| UsageError::Message(format!("invalid size/partition number '{s}'")))?;
    if value < 512 {
        Ok(SizeOrPartNo::PartitionNumber(value as usize))
    } else {
        Ok(SizeOrPartNo::Size(value * 512))
    }
}

fn split_suffix(s: &str) -> Option<(&str, char)> {
    let last = s.chars().last()?;
    if last.is_ascii_alphabetic() {
        Some((&s[..s.len() - 1], last))
    } else {
        None
    }
}

fn parse_size(s: &str) -> Result<u64, UsageError> {
    let invalid = || UsageError::Message(format!("invalid size '{s}'"));

    if let Some((digits, suffix)) = split_suffix(s) {
        let base: u64 = digits.parse().map_err(|_| invalid())?;
        let multiplier: u64 = match suffix {
            'B' => 1,
            'K' => 1024,
            'M' => 1024 * 1024,
            'G' => 1024 * 1024 * 1024,
            'T' => 1024u64 * 1024 * 1024 * 1024,
            'b' => 1,
            'k' => 1_000,
            'm' => 1_000_000,
            'g' => 1_000_000_000,
            't' => 1_000_000_000_000,
            _ => return Err(invalid()),
        };
        return base.checked_mul(multiplier).ok_or_else(invalid);
    }

    s.parse::<u64>()
        .map_err(|_| invalid())
        .and_then(|blocks| blocks.checked_mul(512).ok_or_else(invalid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_minimal_invocation() {
        let args = parse(&argv(&["5000", "disk.img"])).unwrap();
        assert_eq!(args.comm, "5000");
        assert_eq!(args.image, PathBuf::from("disk.img"));
        assert!(!args.read_only);
        assert!(!args.no_vhd);
    }

    #[test]
    fn parses_flags_in_any_position() {
        let args = parse(&argv(&["-r", "--novhd", "-", "disk.img"])).unwrap();
        assert!(args.read_only);
        assert!(args.no_vhd);
        assert_eq!(args.comm, "-");
    }

    #[test]
    fn parses_dll_flag() {
        let args = parse(&argv(&["--dll=mylib;entry", "5000", "disk.img"])).unwrap();
        assert_eq!(args.dll.as_deref(), Some("mylib;entry"));
    }

    #[test]
    fn rejects_too_few_positionals() {
        assert!(parse(&argv(&["5000"])).is_err());
    }

    #[test]
    fn small_bare_number_is_partition_number() {
        let args = parse(&argv(&["5000", "disk.img", "1"])).unwrap();
        assert_eq!(args.size_or_partno, Some(SizeOrPartNo::PartitionNumber(1)));
    }

    #[test]
    fn large_bare_number_is_block_count() {
        let args = parse(&argv(&["5000", "disk.img", "1000"])).unwrap();
        assert_eq!(args.size_or_partno, Some(SizeOrPartNo::Size(1000 * 512)));
    }

    #[test]
    fn binary_suffix_is_base_1024() {
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
    }

    #[test]
    fn decimal_suffix_is_base_1000() {
        assert_eq!(parse_size("1m").unwrap(), 1_000_000);
    }

    #[test]
    fn rejects_garbage_size() {
        assert!(parse_size("abc").is_err());
    }
}
