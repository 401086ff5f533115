//! Internal data generator: produces blocks of random size between
//! configured bounds, optionally filled with a test pattern.

use super::{DataSource, EquipmentError};
use crate::block::DataBlock;
use crate::config::{ConfigError, ConfigMap};
use crate::memory::PagePool;
use std::sync::Arc;
use tracing::warn;

/// Payload fill pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPattern {
    /// Leave page memory untouched.
    None,
    /// Incremental byte pattern.
    IncrementalByte,
    /// Incremental 32-bit words, with one pseudo-random word out of 5.
    IncrementalWord,
}

pub struct GeneratorSource {
    event_min_size: usize,
    event_max_size: usize,
    fill: FillPattern,
    rng_state: u64,
    size_warned: bool,
}

impl GeneratorSource {
    pub fn from_config(cfg: &ConfigMap, section: &str) -> Result<Self, ConfigError> {
        let event_max_size = cfg.get_bytes_or(section, "eventMaxSize", 128 * 1024)? as usize;
        let event_min_size = cfg.get_bytes_or(section, "eventMinSize", 128 * 1024)? as usize;
        let fill = match cfg.get_i64_or(section, "fillData", 0)? {
            0 => FillPattern::None,
            1 => FillPattern::IncrementalByte,
            2 => FillPattern::IncrementalWord,
            v => {
                return Err(ConfigError::BadValue {
                    section: section.into(),
                    key: "fillData".into(),
                    value: v.to_string(),
                    expected: "0, 1 or 2",
                });
            }
        };
        Ok(Self::new(event_min_size, event_max_size, fill))
    }

    pub fn new(event_min_size: usize, event_max_size: usize, fill: FillPattern) -> Self {
        Self {
            event_min_size: event_min_size.min(event_max_size),
            event_max_size: event_max_size.max(event_min_size),
            fill,
            rng_state: 0x9E37_79B9_7F4A_7C15,
            size_warned: false,
        }
    }

    // xorshift64*: deterministic data without pulling in a rand crate
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

impl DataSource for GeneratorSource {
    fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError> {
        let Some(mut block) = pool.new_data_block(None) else {
            return Ok(None);
        };

        let capacity = block.capacity();
        let max = self.event_max_size.min(capacity);
        let min = self.event_min_size.min(max);
        if self.event_max_size > capacity && !self.size_warned {
            warn!(
                "generator event size {} exceeds page payload {}, clamping",
                self.event_max_size, capacity
            );
            self.size_warned = true;
        }

        let span = (max - min) as u64;
        let size = if span == 0 { min } else { min + (self.next_random() % (span + 1)) as usize };

        match self.fill {
            FillPattern::None => {}
            FillPattern::IncrementalByte => {
                for (k, b) in block.payload_mut()[..size].iter_mut().enumerate() {
                    *b = k as u8;
                }
            }
            FillPattern::IncrementalWord => {
                let mut k = 0u32;
                for chunk in block.payload_mut()[..size].chunks_exact_mut(4) {
                    let value = if k % 5 == 0 { self.next_random() as u32 } else { k };
                    chunk.copy_from_slice(&value.to_le_bytes());
                    k += 1;
                }
            }
        }
        block.set_data_size(size);
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BankManager, MemoryBank, PoolSpec};

    fn pool() -> Arc<PagePool> {
        let mgr = BankManager::new();
        mgr.add_bank(Arc::new(MemoryBank::new_malloc(256 * 1024, "gen").unwrap()), "gen");
        mgr.create_pool(&PoolSpec {
            page_size: 8192,
            page_count: 8,
            bank_name: None,
            block_align: 0,
            first_page_offset: 0,
            pool_id: 0,
        })
        .unwrap()
    }

    #[test]
    fn sizes_stay_in_bounds() {
        let pool = pool();
        let mut src = GeneratorSource::new(1024, 4096, FillPattern::None);
        for _ in 0..8 {
            let block = src.next_block(&pool).unwrap().unwrap();
            let size = block.header().data_size as usize;
            assert!((1024..=4096).contains(&size), "size {}", size);
        }
    }

    #[test]
    fn incremental_byte_pattern() {
        let pool = pool();
        let mut src = GeneratorSource::new(256, 256, FillPattern::IncrementalByte);
        let block = src.next_block(&pool).unwrap().unwrap();
        let payload = block.payload();
        assert_eq!(payload.len(), 256);
        for (k, b) in payload.iter().enumerate() {
            assert_eq!(*b, k as u8);
        }
    }

    #[test]
    fn oversized_events_are_clamped() {
        let pool = pool();
        let mut src = GeneratorSource::new(1024 * 1024, 1024 * 1024, FillPattern::None);
        let block = src.next_block(&pool).unwrap().unwrap();
        assert_eq!(block.header().data_size as usize, 8192);
    }

    #[test]
    fn exhausted_pool_yields_none() {
        let pool = pool();
        let mut src = GeneratorSource::new(64, 64, FillPattern::None);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(src.next_block(&pool).unwrap().unwrap());
        }
        assert!(src.next_block(&pool).unwrap().is_none());
    }
}
