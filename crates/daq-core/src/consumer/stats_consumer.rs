//! Statistics sink: totals, interval rates and per-equipment byte
//! accounting for the data stream, published to the console and to the
//! metric queue.

use super::{Consumer, ConsumerError};
use crate::block::DataSet;
use crate::config::ConfigMap;
use crate::pipeline::PipelineContext;
use crate::stats::{Metric, MetricQueue};
use crate::util::format_bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub struct StatsConsumer {
    name: String,
    metrics: Arc<MetricQueue>,
    /// Seconds between interval logs; 0 logs only at stop.
    console_update: f64,

    total_blocks: u64,
    total_bytes: u64,
    interval_blocks: u64,
    interval_bytes: u64,
    bytes_per_equipment: BTreeMap<u16, u64>,
    started: Instant,
    interval_started: Instant,
    next_console_update: Option<Instant>,
}

impl StatsConsumer {
    pub fn from_config(cfg: &ConfigMap, section: &str, ctx: &PipelineContext) -> Result<Self, ConsumerError> {
        Ok(Self {
            name: cfg.get_str_or(section, "name", section),
            metrics: ctx.metrics.clone(),
            console_update: cfg.get_f64_or(section, "consoleUpdate", 0.0)?,
            total_blocks: 0,
            total_bytes: 0,
            interval_blocks: 0,
            interval_bytes: 0,
            bytes_per_equipment: BTreeMap::new(),
            started: Instant::now(),
            interval_started: Instant::now(),
            next_console_update: None,
        })
    }

    fn log_interval(&mut self) {
        let elapsed = self.interval_started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            info!(
                "{}: last interval ({:.2}s): blocks={}, rate={:.2}/s, bytes={}, {}",
                self.name,
                elapsed,
                self.interval_blocks,
                self.interval_blocks as f64 / elapsed,
                self.interval_bytes,
                format_bytes(self.interval_bytes as f64 * 8.0 / elapsed, "b/s"),
            );
        }
        self.interval_blocks = 0;
        self.interval_bytes = 0;
        self.interval_started = Instant::now();
    }
}

impl Consumer for StatsConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ConsumerError> {
        self.total_blocks = 0;
        self.total_bytes = 0;
        self.interval_blocks = 0;
        self.interval_bytes = 0;
        self.bytes_per_equipment.clear();
        self.started = Instant::now();
        self.interval_started = Instant::now();
        self.next_console_update = (self.console_update > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(self.console_update));
        Ok(())
    }

    fn stop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        info!(
            "{}: {} blocks, {} in {:.2}s ({})",
            self.name,
            self.total_blocks,
            format_bytes(self.total_bytes as f64, "B"),
            elapsed,
            format_bytes(if elapsed > 0.0 { self.total_bytes as f64 / elapsed } else { 0.0 }, "B/s"),
        );
        for (eq, bytes) in &self.bytes_per_equipment {
            info!("{}:   equipment {} : {}", self.name, eq, format_bytes(*bytes as f64, "B"));
            self.metrics.push(Metric { name: "readout.bytesEquipment", tag: *eq, value: *bytes });
        }
        self.metrics.push(Metric { name: "readout.blocks", tag: 0, value: self.total_blocks });
        self.metrics.push(Metric { name: "readout.bytesTotal", tag: 0, value: self.total_bytes });
    }

    fn push_set(&mut self, set: &DataSet) -> Result<usize, ConsumerError> {
        for block in set {
            let size = block.header().data_size as u64;
            self.total_blocks += 1;
            self.total_bytes += size;
            self.interval_blocks += 1;
            self.interval_bytes += size;
            *self.bytes_per_equipment.entry(block.header().equipment_id).or_default() += size;
        }
        if let Some(deadline) = self.next_console_update {
            if Instant::now() >= deadline {
                self.log_interval();
                self.next_console_update = Some(deadline + Duration::from_secs_f64(self.console_update));
            }
        }
        Ok(set.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::make_blocks;
    use super::*;

    #[test]
    fn accumulates_totals_and_metrics() {
        let ctx = PipelineContext::new();
        let cfg = ConfigMap::new();
        let mut stats = StatsConsumer::from_config(&cfg, "consumer-stats", &ctx).unwrap();
        stats.start().unwrap();
        let (blocks, _pool) = make_blocks(&[(1, 0, 10), (2, 0, 10), (3, 0, 20)]);
        stats.push_set(&blocks).unwrap();
        assert_eq!(stats.total_blocks, 3);
        assert_eq!(stats.total_bytes, 48);
        assert_eq!(stats.bytes_per_equipment.get(&10), Some(&32));
        assert_eq!(stats.bytes_per_equipment.get(&20), Some(&16));
        stats.stop();
        // final metrics land in the shared queue
        let mut names = Vec::new();
        ctx.metrics.execute(|m| names.push((m.name, m.tag, m.value)));
        assert!(names.contains(&("readout.blocks", 0, 3)));
        assert!(names.contains(&("readout.bytesTotal", 0, 48)));
        assert!(names.contains(&("readout.bytesEquipment", 10, 32)));
    }

    #[test]
    fn start_resets_counters() {
        let ctx = PipelineContext::new();
        let cfg = ConfigMap::new();
        let mut stats = StatsConsumer::from_config(&cfg, "s", &ctx).unwrap();
        stats.start().unwrap();
        let (blocks, _pool) = make_blocks(&[(1, 0, 1)]);
        stats.push_set(&blocks).unwrap();
        stats.start().unwrap();
        assert_eq!(stats.total_blocks, 0);
        assert!(stats.bytes_per_equipment.is_empty());
    }
}
