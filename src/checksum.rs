//! CRC-32 (IEEE) checksums over whole files

use crate::error::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const FILE_READ_BUF: usize = 64 * 1024;

/// Running CRC-32 that can be read at any point without consuming it.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Checksum of everything fed so far. Zero if nothing was fed.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// Checksum a byte slice
pub fn checksum_bytes(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Checksum the full content of a file on disk
pub fn file_checksum(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut crc = Crc32::new();
    let mut buf = vec![0u8; FILE_READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    Ok(crc.value())
}
