//! Fingerprint hashing of guest memory.
//!
//! Fingerprints stand in for full content comparisons: textures are cached by the hash of the
//! TMEM bytes they were decoded from, and render targets remember the hash of the guest memory
//! they last wrote. Collisions are possible and accepted, a colliding texture or render target
//! would be reused as if it were unchanged.

use tracing::debug;
use twox_hash::XxHash3_64;

use crate::config::HashBackend;

pub trait HashEngine: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Hashes `data`, continuing from `seed`.
    fn hash(&self, seed: u32, data: &[u8]) -> u32;

    /// Hashes `count` palette entries. Each entry is 2 bytes followed by 6 bytes of replicas, as
    /// palettes are laid out in TMEM.
    fn palette_hash(&self, seed: u32, data: &[u8], count: usize) -> u32 {
        let mut entries = Vec::with_capacity(count * 2);
        for entry in data.chunks(8).take(count) {
            entries.extend_from_slice(&entry[..entry.len().min(2)]);
        }

        self.hash(seed, &entries)
    }
}

/// CRC32 (IEEE polynomial) using a lookup table built at construction.
#[derive(Clone)]
pub struct TableCrc32 {
    table: Box<[u32; 256]>,
}

impl TableCrc32 {
    const POLYNOMIAL: u32 = 0xEDB8_8320;

    pub fn new() -> Self {
        let mut table = util::boxed_array::<u32, 256>(0);
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ Self::POLYNOMIAL
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }

        Self { table }
    }

    #[inline(always)]
    fn update(&self, crc: u32, data: &[u8]) -> u32 {
        data.iter().fold(crc, |crc, &byte| {
            self.table[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
        })
    }
}

impl std::fmt::Debug for TableCrc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TableCrc32")
    }
}

impl HashEngine for TableCrc32 {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn hash(&self, seed: u32, data: &[u8]) -> u32 {
        !self.update(!seed, data)
    }

    fn palette_hash(&self, seed: u32, data: &[u8], count: usize) -> u32 {
        let crc = data
            .chunks(8)
            .take(count)
            .fold(!seed, |crc, entry| self.update(crc, &entry[..entry.len().min(2)]));

        !crc
    }
}

/// CRC32C computed with the SSE4.2 `crc32` instruction.
#[derive(Debug, Clone, Copy)]
pub struct HardwareCrc32c {
    _private: (),
}

impl HardwareCrc32c {
    /// Returns the engine if the host supports it.
    pub fn new() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("sse4.2") {
                return Some(Self { _private: () });
            }
        }

        None
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c(crc: u32, data: &[u8]) -> u32 {
    use std::arch::x86_64::{_mm_crc32_u8, _mm_crc32_u64};

    let mut crc = crc as u64;
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0; 8];
        word.copy_from_slice(chunk);
        crc = _mm_crc32_u64(crc, u64::from_le_bytes(word));
    }

    let mut crc = crc as u32;
    for &byte in chunks.remainder() {
        crc = _mm_crc32_u8(crc, byte);
    }

    crc
}

impl HashEngine for HardwareCrc32c {
    fn name(&self) -> &'static str {
        "crc32c"
    }

    fn hash(&self, seed: u32, data: &[u8]) -> u32 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: instances are only constructed when sse4.2 is available
            !unsafe { crc32c(!seed, data) }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (seed, data);
            unreachable!("hardware crc32c is only constructed on x86_64")
        }
    }
}

/// 64-bit XXH3 folded to 32 bits.
#[derive(Debug, Clone, Copy)]
pub struct Xxh3Hash;

impl HashEngine for Xxh3Hash {
    fn name(&self) -> &'static str {
        "xxh3"
    }

    fn hash(&self, seed: u32, data: &[u8]) -> u32 {
        let hash = XxHash3_64::oneshot_with_seed(seed as u64, data);
        (hash ^ (hash >> 32)) as u32
    }
}

/// Resolves the hash engine to use for the whole session.
pub fn select(backend: HashBackend) -> Box<dyn HashEngine> {
    let engine: Box<dyn HashEngine> = match backend {
        HashBackend::Table => Box::new(TableCrc32::new()),
        HashBackend::Xxh3 => Box::new(Xxh3Hash),
        HashBackend::Hardware | HashBackend::Auto => match HardwareCrc32c::new() {
            Some(engine) => Box::new(engine),
            None => {
                if backend == HashBackend::Hardware {
                    debug!("hardware crc32c unavailable, falling back to table crc32");
                }
                Box::new(TableCrc32::new())
            }
        },
    };

    debug!(engine = engine.name(), "selected hash engine");
    engine
}
