//! Opens the backing store, auto-detects a VHD, resolves a partition or
//! plugin selection, and assembles the `LogicalDevice` a session is then
//! run against.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use bdproxy_core::Error;
use bdproxy_partition::PartitionTable;
use bdproxy_pipeline::MmapPipeline;
use bdproxy_protocol::LogicalDevice;
use bdproxy_store::{BackingStore, FileStore, IoPlugin, PluginStore};
use bdproxy_vhd::VhdEngine;

use crate::cli::{Args, SizeOrPartNo};

/// A backing file is already held open for write by another process.
/// Downcast for in `main` to map onto the "cannot dismount a volume held
/// open for write" exit code.
#[derive(Debug)]
pub struct ExclusiveLockError(pub PathBuf);

impl fmt::Display for ExclusiveLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' is already open for write elsewhere",
            self.0.display()
        )
    }
}

impl std::error::Error for ExclusiveLockError {}

/// Plugins this binary was built with, keyed by the name given after
/// `--dll=`. Empty: this workspace carries the `IoPlugin` contract and
/// `PluginStore` resolver but ships no concrete plugin, so any `--dll=`
/// name reaches a real resolution attempt and fails with a clear
/// "no plugin registered" error rather than being silently dropped.
const PLUGIN_REGISTRY: &[(&str, fn() -> Box<dyn IoPlugin>)] = &[];

pub fn open_device(args: &Args) -> Result<LogicalDevice> {
    if let Some(spec) = &args.dll {
        return open_plugin_device(spec, args);
    }

    let is_vhd = !args.no_vhd && VhdEngine::probe(&args.image).unwrap_or(false);

    if is_vhd {
        return open_vhd_device(args);
    }

    open_raw_device(args)
}

fn open_plugin_device(spec: &str, args: &Args) -> Result<LogicalDevice> {
    let name = spec.split(';').next().unwrap_or(spec);
    let store = PluginStore::resolve(name, PLUGIN_REGISTRY)
        .map_err(|e: Error| anyhow::anyhow!("resolving plugin '{name}': {e}"))?;

    tracing::info!(plugin = name, size = store.len(), "Successfully opened plugin-backed store.");

    let length_override = match &args.size_or_partno {
        None => None,
        Some(SizeOrPartNo::Size(size)) => Some(*size),
        Some(SizeOrPartNo::PartitionNumber(_)) => {
            anyhow::bail!("partition selection is not supported against a plugin-backed store");
        }
    };

    Ok(LogicalDevice::new_raw(
        Box::new(store),
        0,
        length_override,
        args.read_only,
    ))
}

fn open_vhd_device(args: &Args) -> Result<LogicalDevice> {
    let path = &args.image;
    let mut engine = VhdEngine::open(path, args.read_only)
        .with_context(|| format!("opening '{}' as a VHD", path.display()))?;

    if !args.read_only && !engine.try_lock_exclusive()? {
        return Err(anyhow::Error::new(ExclusiveLockError(path.to_path_buf())));
    }

    tracing::info!(
        path = %path.display(),
        size = engine.len(),
        "Successfully opened VHD image ({}).",
        bdproxy_core::format_size(engine.len())
    );

    let (image_offset, length_override) = match &args.size_or_partno {
        None => (0, None),
        Some(SizeOrPartNo::Size(_)) => {
            tracing::warn!("an explicit size is ignored for VHD images; using offset 0");
            (0, None)
        }
        Some(SizeOrPartNo::PartitionNumber(number)) => {
            let engine_len = engine.len();
            let mut cursor = EngineCursor::new(&mut engine);
            let table = PartitionTable::parse(&mut cursor, 512)
                .map_err(|e: Error| anyhow::anyhow!("parsing MBR on '{}': {e}", path.display()))?;

            if table.is_gpt_protective() {
                anyhow::bail!(
                    "'{}' has a GPT protective MBR; GPT partitions are not supported",
                    path.display()
                );
            }

            let entry = table
                .resolve(*number)
                .map_err(|e: Error| anyhow::anyhow!("{e}"))?;
            if entry.offset >= engine_len {
                anyhow::bail!(
                    "partition {number} starts at {} but the VHD's logical content is only {engine_len} bytes",
                    entry.offset
                );
            }

            tracing::info!(partition = number, offset = entry.offset, "Using partition.");
            (entry.offset, Some(entry.length))
        }
    };

    Ok(LogicalDevice::new_vhd(
        engine,
        image_offset,
        length_override,
        args.read_only,
    ))
}

fn open_raw_device(args: &Args) -> Result<LogicalDevice> {
    let store = open_backing_store(args)?;
    let (image_offset, length_override) =
        resolve_partition(&args.image, args.size_or_partno.as_ref(), store.len())?;

    Ok(LogicalDevice::new_raw(
        store,
        image_offset,
        length_override,
        args.read_only,
    ))
}

/// A read-only open tries a memory-mapped store first, falling back to
/// `FileStore` if mapping fails (an oversized file, or one that isn't a
/// regular file). Writable opens always use `FileStore`, and take the
/// exclusive advisory lock a read-only mapping doesn't need.
fn open_backing_store(args: &Args) -> Result<Box<dyn BackingStore>> {
    if args.read_only {
        match MmapPipeline::open(&args.image) {
            Ok(mmap) => {
                tracing::info!(
                    path = %args.image.display(),
                    size = mmap.len(),
                    "Successfully memory-mapped backing store ({}).",
                    bdproxy_core::format_size(mmap.len())
                );
                return Ok(Box::new(mmap));
            }
            Err(e) => {
                tracing::debug!(error = %e, "memory mapping failed, falling back to file I/O");
            }
        }
    }

    let store = FileStore::open(&args.image, args.read_only)
        .with_context(|| format!("opening '{}'", args.image.display()))?;

    if !args.read_only && !store.try_lock_exclusive()? {
        return Err(anyhow::Error::new(ExclusiveLockError(args.image.clone())));
    }

    tracing::info!(
        path = %args.image.display(),
        size = store.len(),
        "Successfully opened backing store ({}).",
        bdproxy_core::format_size(store.len())
    );

    Ok(Box::new(store))
}

/// Resolves the CLI's overloaded third positional against a raw (non-VHD)
/// backing store: a partition number is looked up in the file's own MBR
/// (returning both its offset and its own declared size), an explicit size
/// is passed straight through as a length override, and no selection at
/// all leaves both unset (the whole store, from offset 0).
fn resolve_partition(
    path: &Path,
    size_or_partno: Option<&SizeOrPartNo>,
    store_len: u64,
) -> Result<(u64, Option<u64>)> {
    match size_or_partno {
        None => Ok((0, None)),
        Some(SizeOrPartNo::Size(size)) => Ok((0, Some(*size))),
        Some(SizeOrPartNo::PartitionNumber(number)) => {
            let mut file = std::fs::File::open(path).with_context(|| {
                format!("re-opening '{}' to read its partition table", path.display())
            })?;
            let table = PartitionTable::parse(&mut file, 512)
                .map_err(|e: Error| anyhow::anyhow!("parsing MBR on '{}': {e}", path.display()))?;

            if table.is_gpt_protective() {
                anyhow::bail!(
                    "'{}' has a GPT protective MBR; GPT partitions are not supported",
                    path.display()
                );
            }

            let entry = table
                .resolve(*number)
                .map_err(|e: Error| anyhow::anyhow!("{e}"))?;
            if entry.offset >= store_len {
                anyhow::bail!(
                    "partition {number} starts at {} but the backing store is only {store_len} bytes",
                    entry.offset
                );
            }

            tracing::info!(partition = number, offset = entry.offset, "Using partition.");
            Ok((entry.offset, Some(entry.length)))
        }
    }
}

/// `Read + Seek` adapter over a `VhdEngine`'s logical (virtual-disk)
/// content, needed only because `PartitionTable::parse` is an MBR/EBR
/// format parser written against a stream cursor, and a VHD has no such
/// cursor of its own (it's addressed by offset, like everything else in
/// this workspace). Scoped to this one bootstrap-time use; the session
/// path never needs a seek cursor over a VHD.
struct EngineCursor<'a> {
    engine: &'a mut VhdEngine,
    pos: u64,
}

impl<'a> EngineCursor<'a> {
    fn new(engine: &'a mut VhdEngine) -> Self {
        Self { engine, pos: 0 }
    }
}

impl Read for EngineCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.engine.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for EngineCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => self.engine.len() as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}
