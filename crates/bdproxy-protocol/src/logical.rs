//! The device a session actually reads and writes: a backing store (and
//! optionally a VHD engine) windowed by the partition offset chosen at
//! bootstrap, addressed purely in logical (client-visible) terms.

use std::io;

use bdproxy_pipeline::PartialPipeline;
use bdproxy_store::BackingStore;
use bdproxy_vhd::VhdEngine;

enum Backing {
    Vhd(PartialPipeline<VhdEngine>),
    Raw(PartialPipeline<Box<dyn BackingStore>>),
}

/// A logical block device: a window starting `image_offset` bytes into the
/// backing store, optionally VHD-translated. The window length is either
/// the partition's own declared size (`length_override`, from the MBR) or,
/// absent a partition selection, everything remaining in the backing store.
pub struct LogicalDevice {
    backing: Backing,
    read_only: bool,
}

impl LogicalDevice {
    pub fn new_vhd(
        engine: VhdEngine,
        image_offset: u64,
        length_override: Option<u64>,
        read_only: bool,
    ) -> Self {
        let natural = engine.len().saturating_sub(image_offset);
        let length = length_override.map_or(natural, |l| l.min(natural));
        Self {
            backing: Backing::Vhd(PartialPipeline::new(engine, image_offset, length)),
            read_only,
        }
    }

    pub fn new_raw(
        store: Box<dyn BackingStore>,
        image_offset: u64,
        length_override: Option<u64>,
        read_only: bool,
    ) -> Self {
        let read_only = read_only || store.read_only();
        let natural = store.len().saturating_sub(image_offset);
        let length = length_override.map_or(natural, |l| l.min(natural));
        Self {
            backing: Backing::Raw(PartialPipeline::new(store, image_offset, length)),
            read_only,
        }
    }

    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::Vhd(pipeline) => pipeline.length(),
            Backing::Raw(pipeline) => pipeline.length(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Read `buf.len()` bytes at logical `offset`, clipped to the device's
    /// length. Short of `buf.len()` only at end-of-device.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.backing {
            Backing::Vhd(pipeline) => pipeline.read_at(offset, buf),
            Backing::Raw(pipeline) => pipeline.read_at(offset, buf),
        }
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device is read-only",
            ));
        }
        match &mut self.backing {
            Backing::Vhd(pipeline) => pipeline.write_at(offset, buf),
            Backing::Raw(pipeline) => pipeline.write_at(offset, buf),
        }
    }
}
