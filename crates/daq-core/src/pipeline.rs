//! Shared process context handed into every pipeline component.
//!
//! There are no process-wide mutable statics: `main` owns one
//! [`PipelineContext`] and passes it by reference into constructors.

use crate::memory::BankManager;
use crate::stats::{DaqStats, MetricQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::warn;

pub struct PipelineContext {
    pub banks: Arc<BankManager>,
    pub stats: Arc<DaqStats>,
    pub metrics: Arc<MetricQueue>,
    run_number: Arc<AtomicU32>,
    stop_requested: Arc<AtomicBool>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            banks: Arc::new(BankManager::new()),
            stats: Arc::new(DaqStats::new()),
            metrics: Arc::new(MetricQueue::new()),
            run_number: Arc::new(AtomicU32::new(0)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_run_number(&self, run: u32) {
        self.run_number.store(run, Ordering::Relaxed);
    }

    pub fn run_number(&self) -> u32 {
        self.run_number.load(Ordering::Relaxed)
    }

    /// Shared handle to the run number, read at block-stamping time.
    pub fn run_number_cell(&self) -> Arc<AtomicU32> {
        self.run_number.clone()
    }

    /// Asks the supervisor to end the run; used by components configured
    /// with `stopOnError`.
    pub fn request_stop(&self, who: &str, reason: &str) {
        warn!("{} requested a run stop: {}", who, reason);
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Shared handle to the stop flag, for loops that outlive borrows.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_is_sticky() {
        let ctx = PipelineContext::new();
        assert!(!ctx.is_stop_requested());
        ctx.request_stop("equipment-a", "test");
        assert!(ctx.is_stop_requested());
    }

    #[test]
    fn run_number_roundtrip() {
        let ctx = PipelineContext::new();
        ctx.set_run_number(1234);
        assert_eq!(ctx.run_number(), 1234);
    }
}

#[cfg(test)]
mod pipeline_tests {
    //! Whole-pipeline scenarios: equipment -> aggregator -> fan-out.

    use super::*;
    use crate::aggregator::{Aggregator, AggregatorConfig};
    use crate::block::{DataBlock, DataSet};
    use crate::config::ConfigMap;
    use crate::consumer::{Consumer, ConsumerError, ConsumerSlot, Fanout};
    use crate::equipment::{DataSource, Equipment, EquipmentError, create_equipment};
    use crate::memory::{MemoryBank, PagePool};
    use crate::rdh::RdhBuilder;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    struct Collector {
        seen: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl Consumer for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn push_set(&mut self, set: &DataSet) -> Result<usize, ConsumerError> {
            let mut seen = self.seen.lock().unwrap();
            for b in set {
                seen.push((b.header().block_id, b.header().timeframe_id));
            }
            Ok(set.len())
        }
    }

    fn ctx_with_bank() -> PipelineContext {
        let ctx = PipelineContext::new();
        ctx.banks.add_bank(
            Arc::new(MemoryBank::new_malloc(2 * 1024 * 1024, "main").unwrap()),
            "main",
        );
        ctx
    }

    #[test]
    fn generator_to_consumer_end_to_end() {
        let ctx = ctx_with_bank();
        let mut cfg = ConfigMap::new();
        cfg.set("equipment-dummy-1", "equipmentType", "dummy");
        cfg.set("equipment-dummy-1", "id", "7");
        cfg.set("equipment-dummy-1", "memoryPoolPageSize", "8k");
        cfg.set("equipment-dummy-1", "memoryPoolNumberOfPages", "32");
        cfg.set("equipment-dummy-1", "blockAlign", "0");
        cfg.set("equipment-dummy-1", "eventMinSize", "512");
        cfg.set("equipment-dummy-1", "eventMaxSize", "512");

        let mut equipment = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        // short slice timeout so slices close while the run is ongoing
        let agg_config = AggregatorConfig {
            slice_timeout: 0.02,
            ..AggregatorConfig::default()
        };
        let mut aggregator = Aggregator::new(agg_config, &ctx);
        aggregator.add_input(equipment.output());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot = ConsumerSlot::new(Box::new(Collector { seen: seen.clone() }));
        let mut fanout = Fanout::new(aggregator.output(), vec![slot], &ctx);

        fanout.start().unwrap();
        aggregator.start();
        equipment.start().unwrap();
        equipment.set_data_on();

        let t0 = Instant::now();
        while seen.lock().unwrap().len() < 20 && t0.elapsed() < Duration::from_secs(3) {
            std::thread::sleep(Duration::from_millis(2));
        }

        equipment.set_data_off();
        equipment.stop();
        aggregator.flush_and_wait(Duration::from_secs(2));
        let out = aggregator.output();
        let drain_deadline = Instant::now() + Duration::from_secs(1);
        while !out.is_empty() && Instant::now() < drain_deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        fanout.stop();
        aggregator.stop();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 20, "only {} blocks delivered", seen.len());
        // per-source order survives the whole pipeline
        for (i, (block_id, tf_id)) in seen.iter().enumerate() {
            assert_eq!(*block_id, i as u64 + 1);
            assert_ne!(*tf_id, 0);
        }
        // bytes were accounted globally
        assert!(ctx.stats.bytes_readout.load(Ordering::Relaxed) >= 20 * 512);
        assert!(ctx.stats.subtimeframes.load(Ordering::Relaxed) > 0);
    }

    /// Source injecting pages whose first packet header carries an
    /// illegal version.
    struct BadRdhSource {
        remaining: u32,
    }

    impl DataSource for BadRdhSource {
        fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            let Some(mut block) = pool.new_data_block(None) else {
                return Ok(None);
            };
            self.remaining -= 1;
            let mut builder = RdhBuilder::default();
            builder.link_id = 3;
            builder.orbit = 100;
            builder.offset_next_packet = 0;
            builder.write(block.payload_mut());
            block.payload_mut()[0] = 0x99; // illegal header version
            block.set_data_size(256);
            Ok(Some(block))
        }
    }

    #[test]
    fn rdh_errors_are_counted_and_pages_saved() {
        let ctx = ctx_with_bank();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ConfigMap::new();
        cfg.set("equipment-bad-1", "name", "bad");
        cfg.set("equipment-bad-1", "memoryPoolPageSize", "4k");
        cfg.set("equipment-bad-1", "memoryPoolNumberOfPages", "32");
        cfg.set("equipment-bad-1", "blockAlign", "0");
        cfg.set("equipment-bad-1", "rdhCheckEnabled", "1");
        cfg.set("equipment-bad-1", "saveErrorPagesMax", "4");
        cfg.set("equipment-bad-1", "saveErrorPagesPath", dir.path().to_str().unwrap());

        let source = BadRdhSource { remaining: 10 };
        let mut equipment = Equipment::new(&cfg, "equipment-bad-1", &ctx, Box::new(source), true).unwrap();
        equipment.start().unwrap();
        equipment.set_data_on();

        let out = equipment.output();
        let mut received = Vec::new();
        let t0 = Instant::now();
        while received.len() < 10 && t0.elapsed() < Duration::from_secs(3) {
            match out.pop() {
                Some(b) => received.push(b),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        let errors = equipment.counters().rdh_check_err.load(Ordering::Relaxed);
        equipment.stop();

        assert_eq!(received.len(), 10, "run must continue past header errors");
        assert_eq!(errors, 10);
        let saved = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(saved, 4, "exactly saveErrorPagesMax pages on disk");
        assert!(!ctx.is_stop_requested());
    }

    #[test]
    fn timeframe_rate_limit_parks_blocks() {
        let ctx = ctx_with_bank();
        let mut cfg = ConfigMap::new();
        cfg.set("equipment-dummy-1", "equipmentType", "dummy");
        cfg.set("equipment-dummy-1", "memoryPoolPageSize", "4k");
        cfg.set("equipment-dummy-1", "memoryPoolNumberOfPages", "64");
        cfg.set("equipment-dummy-1", "blockAlign", "0");
        cfg.set("equipment-dummy-1", "eventMinSize", "128");
        cfg.set("equipment-dummy-1", "eventMaxSize", "128");
        // software timeframe clock ticking at the orbit rate
        cfg.set("equipment-dummy-1", "TFperiod", "1");
        cfg.set("readout", "tfRateLimit", "50");

        let mut equipment = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        equipment.start().unwrap();
        equipment.set_data_on();

        let out = equipment.output();
        let run = Duration::from_millis(300);
        let t0 = Instant::now();
        while t0.elapsed() < run {
            out.pop();
            std::thread::sleep(Duration::from_micros(100));
        }
        let timeframes = equipment.counters().n_timeframes.load(Ordering::Relaxed);
        let throttled = equipment.counters().n_throttle.load(Ordering::Relaxed);
        equipment.stop();

        // admitted timeframes <= limit * time + 1, with scheduling slack
        assert!(timeframes <= 50 * 3 / 10 + 3, "{} timeframes admitted", timeframes);
        assert!(throttled > 0);
    }
}
