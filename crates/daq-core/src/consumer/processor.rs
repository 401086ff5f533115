//! Compressing processor sink: compresses each block payload into pages
//! from its own pool and hands the compressed set to a forward consumer.

use super::{Consumer, ConsumerError};
use crate::block::DataSet;
use crate::config::ConfigMap;
use crate::memory::{PagePool, PoolSpec};
use crate::pipeline::PipelineContext;
use crate::util::format_bytes;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ZstdProcessor {
    name: String,
    pool: Arc<PagePool>,
    level: i32,
    output: Option<DataSet>,
    bytes_in: u64,
    bytes_out: u64,
    blocks_dropped: u64,
    drop_warned: bool,
}

impl ZstdProcessor {
    pub fn from_config(cfg: &ConfigMap, section: &str, ctx: &PipelineContext) -> Result<Self, ConsumerError> {
        let page_size = cfg.get_bytes_or(section, "memoryPoolPageSize", 128 * 1024)? as usize;
        let page_count = cfg.get_i64_or(section, "memoryPoolNumberOfPages", 16)?.max(1) as usize;
        let pool = ctx
            .banks
            .create_pool(&PoolSpec {
                page_size,
                page_count,
                bank_name: cfg.get_str(section, "memoryBankName").map(str::to_string),
                block_align: 0,
                first_page_offset: 0,
                pool_id: -1,
            })
            .map_err(|e| ConsumerError::Failed(e.to_string()))?;
        Ok(Self {
            name: cfg.get_str_or(section, "name", section),
            pool,
            level: cfg.get_i64_or(section, "compressionLevel", 3)? as i32,
            output: None,
            bytes_in: 0,
            bytes_out: 0,
            blocks_dropped: 0,
            drop_warned: false,
        })
    }

    fn drop_block(&mut self, reason: &str) {
        self.blocks_dropped += 1;
        if !self.drop_warned {
            warn!("{}: dropping block(s): {}", self.name, reason);
            self.drop_warned = true;
        }
    }
}

impl Consumer for ZstdProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ConsumerError> {
        self.output = None;
        self.bytes_in = 0;
        self.bytes_out = 0;
        self.blocks_dropped = 0;
        self.drop_warned = false;
        Ok(())
    }

    fn stop(&mut self) {
        let ratio = if self.bytes_in > 0 {
            self.bytes_out as f64 / self.bytes_in as f64
        } else {
            0.0
        };
        info!(
            "{}: compressed {} -> {} (ratio {:.3}), {} blocks dropped",
            self.name,
            format_bytes(self.bytes_in as f64, "B"),
            format_bytes(self.bytes_out as f64, "B"),
            ratio,
            self.blocks_dropped,
        );
    }

    fn push_set(&mut self, set: &DataSet) -> Result<usize, ConsumerError> {
        let mut compressed_set = DataSet::new();
        for block in set {
            let payload = block.payload();
            let compressed = zstd::bulk::compress(payload, self.level)
                .map_err(|e| ConsumerError::Failed(format!("compression failed: {}", e)))?;

            let Some(mut out) = self.pool.new_data_block(None) else {
                self.drop_block("no free page in processor pool");
                continue;
            };
            if compressed.len() > out.capacity() {
                self.drop_block("compressed payload exceeds page size");
                continue;
            }
            out.payload_mut()[..compressed.len()].copy_from_slice(&compressed);
            out.set_data_size(compressed.len());
            // keep the provenance of the original block
            let src = block.header().clone();
            let h = out.header_mut();
            h.block_id = src.block_id;
            h.pipeline_id = src.pipeline_id;
            h.timeframe_id = src.timeframe_id;
            h.system_id = src.system_id;
            h.fee_id = src.fee_id;
            h.equipment_id = src.equipment_id;
            h.link_id = src.link_id;
            h.timeframe_orbit_first = src.timeframe_orbit_first;
            h.timeframe_orbit_last = src.timeframe_orbit_last;
            h.run_number = src.run_number;
            h.is_rdh_format = false;

            self.bytes_in += payload.len() as u64;
            self.bytes_out += compressed.len() as u64;
            compressed_set.push(Arc::new(out));
        }
        let produced = compressed_set.len();
        self.output = (!compressed_set.is_empty()).then_some(compressed_set);
        Ok(produced)
    }

    fn take_forward_output(&mut self) -> Option<DataSet> {
        self.output.take()
    }
}
