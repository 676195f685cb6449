//! Small traits used at crate seams that need "a stream I can read and
//! seek", or "a thing addressed by position rather than a cursor", without
//! naming a concrete type.

use std::io::{self, Read, Seek};

/// Anything that can be read from and seeked within, and sent across a
/// thread boundary (the server itself is single-threaded, but backing
/// stores are constructed before the session's transport type is known, so
/// `Send` keeps them boxable).
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Positioned, non-seeking access to a byte-addressable backing object.
/// `VhdEngine` and `Box<dyn BackingStore>` both already shape their I/O
/// this way (offset in, buffer in/out) rather than as a `Read + Seek`
/// cursor, so this is the common bound windowing code (`PartialPipeline`)
/// needs to work over either one.
pub trait OffsetStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;
}
