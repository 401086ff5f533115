//! File replay source: preloads a raw data file and replays it chunked
//! into pool pages, optionally in a loop.

use super::{DataSource, EquipmentError};
use crate::block::DataBlock;
use crate::config::{ConfigError, ConfigMap};
use crate::memory::PagePool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct PlayerSource {
    path: PathBuf,
    /// Bytes per emitted block; 0 means "fill each page".
    bytes_per_page: usize,
    loop_playback: bool,
    data: Vec<u8>,
    position: usize,
    passes_done: u64,
}

impl PlayerSource {
    pub fn from_config(cfg: &ConfigMap, section: &str) -> Result<Self, ConfigError> {
        let path = PathBuf::from(cfg.require_str(section, "filePath")?);
        Ok(Self {
            path,
            bytes_per_page: cfg.get_bytes_or(section, "bytesPerPage", 0)? as usize,
            loop_playback: cfg.get_bool_or(section, "autoChunkLoop", false)?,
            data: Vec::new(),
            position: 0,
            passes_done: 0,
        })
    }

    pub fn passes_done(&self) -> u64 {
        self.passes_done
    }
}

impl DataSource for PlayerSource {
    fn start(&mut self) -> Result<(), EquipmentError> {
        self.data = std::fs::read(&self.path)
            .map_err(|e| EquipmentError::Source(format!("cannot read {}: {}", self.path.display(), e)))?;
        if self.data.is_empty() {
            return Err(EquipmentError::Source(format!("{} is empty", self.path.display())));
        }
        self.position = 0;
        self.passes_done = 0;
        info!("player: loaded {} bytes from {}", self.data.len(), self.path.display());
        Ok(())
    }

    fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError> {
        if self.position >= self.data.len() {
            if !self.loop_playback || self.data.is_empty() {
                return Ok(None);
            }
            self.position = 0;
            self.passes_done += 1;
        }

        let Some(mut block) = pool.new_data_block(None) else {
            return Ok(None);
        };
        let chunk_size = if self.bytes_per_page == 0 {
            block.capacity()
        } else {
            self.bytes_per_page.min(block.capacity())
        };
        let remaining = self.data.len() - self.position;
        let size = chunk_size.min(remaining);
        block.payload_mut()[..size].copy_from_slice(&self.data[self.position..self.position + size]);
        block.set_data_size(size);
        self.position += size;
        if self.position >= self.data.len() && !self.loop_playback {
            self.passes_done = 1;
        }
        Ok(Some(block))
    }

    fn stop(&mut self) {
        self.data = Vec::new();
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BankManager, MemoryBank, PoolSpec};
    use std::io::Write;

    fn pool() -> Arc<PagePool> {
        let mgr = BankManager::new();
        mgr.add_bank(Arc::new(MemoryBank::new_malloc(256 * 1024, "play").unwrap()), "play");
        mgr.create_pool(&PoolSpec {
            page_size: 1024,
            page_count: 16,
            bank_name: None,
            block_align: 0,
            first_page_offset: 0,
            pool_id: 0,
        })
        .unwrap()
    }

    fn player(content: &[u8], extra: &[(&str, &str)]) -> PlayerSource {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        let mut cfg = ConfigMap::new();
        cfg.set("p", "filePath", file.path().to_str().unwrap());
        for (k, v) in extra {
            cfg.set("p", k, v);
        }
        let mut src = PlayerSource::from_config(&cfg, "p").unwrap();
        src.start().unwrap();
        // keep the temp file alive past start() by leaking the handle
        std::mem::forget(file);
        src
    }

    #[test]
    fn replays_file_in_chunks() {
        let pool = pool();
        let content: Vec<u8> = (0..2500u32).map(|v| v as u8).collect();
        let mut src = player(&content, &[]);
        let mut replayed = Vec::new();
        while let Some(block) = src.next_block(&pool).unwrap() {
            replayed.extend_from_slice(block.payload());
        }
        assert_eq!(replayed, content);
    }

    #[test]
    fn chunk_size_override() {
        let pool = pool();
        let content = vec![7u8; 1000];
        let mut src = player(&content, &[("bytesPerPage", "256")]);
        let block = src.next_block(&pool).unwrap().unwrap();
        assert_eq!(block.header().data_size, 256);
    }

    #[test]
    fn loop_playback_restarts() {
        let pool = pool();
        let content = vec![1u8; 100];
        let mut src = player(&content, &[("autoChunkLoop", "1")]);
        for _ in 0..5 {
            assert!(src.next_block(&pool).unwrap().is_some());
        }
        assert!(src.passes_done() >= 4);
    }

    #[test]
    fn missing_file_fails_at_start() {
        let mut cfg = ConfigMap::new();
        cfg.set("p", "filePath", "/nonexistent/input.raw");
        let mut src = PlayerSource::from_config(&cfg, "p").unwrap();
        assert!(src.start().is_err());
    }
}
