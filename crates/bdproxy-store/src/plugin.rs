//! Plugin-backed store: the Rust expression of the original's
//! arbitrary-DLL `--dll=` capability contract.
//!
//! Rust has no portable "load an arbitrary shared object by convention at
//! runtime" story comparable to the original's dynamic-library loading, so
//! the contract itself — open/read/write/close — is what's carried
//! forward: a plugin is a type implementing [`IoPlugin`], resolved at
//! compile time through a small name-keyed registry rather than `dlopen`.

use std::io;

use bdproxy_core::Result;

use crate::BackingStore;

/// Four-operation capability contract a backing-store plugin implements.
pub trait IoPlugin: Send {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn len(&self) -> u64;
    fn read_only(&self) -> bool;
}

pub struct PluginStore {
    plugin: std::sync::Mutex<Box<dyn IoPlugin>>,
}

impl PluginStore {
    pub fn new(plugin: Box<dyn IoPlugin>) -> Self {
        Self {
            plugin: std::sync::Mutex::new(plugin),
        }
    }

    /// Resolve a plugin by the name given after `--dll=` against a
    /// compile-time registry. Returns `Unsupported` for any name the
    /// binary wasn't built with a matching plugin for.
    pub fn resolve(name: &str, registry: &[(&str, fn() -> Box<dyn IoPlugin>)]) -> Result<Self> {
        registry
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, ctor)| Self::new(ctor()))
            .ok_or_else(|| bdproxy_core::Error::unsupported(format!("no plugin registered as '{name}'")))
    }
}

impl BackingStore for PluginStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.plugin.lock().unwrap().read(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.plugin.lock().unwrap().write(buf, offset)
    }

    fn len(&self) -> u64 {
        self.plugin.lock().unwrap().len()
    }

    fn read_only(&self) -> bool {
        self.plugin.lock().unwrap().read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemPlugin(Vec<u8>);

    impl IoPlugin for MemPlugin {
        fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let start = offset as usize;
            if start >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
            let end = offset as usize + buf.len();
            if end > self.0.len() {
                self.0.resize(end, 0);
            }
            self.0[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_only(&self) -> bool {
            false
        }
    }

    fn make_plugin() -> Box<dyn IoPlugin> {
        Box::new(MemPlugin(vec![0u8; 16]))
    }

    #[test]
    fn resolves_registered_plugin() {
        let registry: &[(&str, fn() -> Box<dyn IoPlugin>)] = &[("mem", make_plugin)];
        let store = PluginStore::resolve("mem", registry).unwrap();
        assert_eq!(store.len(), 16);
    }

    #[test]
    fn unknown_plugin_name_is_unsupported() {
        let registry: &[(&str, fn() -> Box<dyn IoPlugin>)] = &[("mem", make_plugin)];
        assert!(PluginStore::resolve("nonexistent", registry).is_err());
    }

    #[test]
    fn read_write_round_trip() {
        let registry: &[(&str, fn() -> Box<dyn IoPlugin>)] = &[("mem", make_plugin)];
        let store = PluginStore::resolve("mem", registry).unwrap();
        store.pwrite(&[1, 2, 3], 4).unwrap();
        let mut buf = [0u8; 3];
        store.pread(&mut buf, 4).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
