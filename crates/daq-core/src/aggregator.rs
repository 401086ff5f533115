//! Aggregator: groups the blocks of each (equipment, link) pair into
//! slices of one timeframe, and optionally assembles the slices of all
//! sources into complete timeframes emitted in strictly increasing id
//! order.

use crate::block::{DataBlockRef, DataSet, UNDEFINED_LINK_ID, UNDEFINED_TIMEFRAME_ID};
use crate::config::{ConfigError, ConfigMap};
use crate::fifo::Fifo;
use crate::memory::PageState;
use crate::pipeline::PipelineContext;
use crate::rdh::RDH_MAX_LINK_ID;
use crate::stats::DaqStats;
use crate::thread::{LoopStatus, LoopThread};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Per-iteration bound on blocks drained from one input and on slices
/// popped from one slicer, so every input is served regularly.
const MAX_LOOP: usize = 1024;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Pass blocks through one-per-set without grouping.
    pub disable_slicing: bool,
    /// Close partial slices not updated for this long, seconds (0 = off).
    pub slice_timeout: f64,
    /// Buffer slices and emit whole timeframes; a timeframe completes
    /// when unchanged for `tf_timeout` seconds. Enabled when > 0.
    pub tf_timeout: f64,
    pub output_fifo_size: usize,
    pub idle_sleep: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            disable_slicing: false,
            slice_timeout: 0.0,
            tf_timeout: 0.0,
            output_fifo_size: 1000,
            idle_sleep: Duration::from_micros(1000),
        }
    }
}

impl AggregatorConfig {
    pub fn from_config(cfg: &ConfigMap) -> Result<Self, ConfigError> {
        let config = Self {
            disable_slicing: cfg.get_bool_or("readout", "disableAggregatorSlicing", false)?,
            slice_timeout: cfg.get_f64_or("readout", "aggregatorSliceTimeout", 0.0)?,
            tf_timeout: cfg.get_f64_or("readout", "aggregatorStfTimeout", 0.0)?,
            output_fifo_size: cfg.get_i64_or("readout", "aggregatorOutputFifoSize", 1000)?.max(1) as usize,
            idle_sleep: Duration::from_micros(cfg.get_i64_or("readout", "aggregatorIdleSleepTime", 1000)?.max(1) as u64),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn tf_building_enabled(&self) -> bool {
        self.tf_timeout > 0.0
    }

    /// Timeframe building requires slicing: the combination is rejected
    /// at configuration time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disable_slicing && self.tf_building_enabled() {
            return Err(ConfigError::BadValue {
                section: "readout".into(),
                key: "disableAggregatorSlicing".into(),
                value: "1".into(),
                expected: "slicing enabled when timeframe building is on",
            });
        }
        Ok(())
    }
}

struct PartialSlice {
    tf_id: u64,
    last_update: f64,
    set: DataSet,
}

/// Groups contiguous same-timeframe blocks of one input, keyed by
/// (equipment id, link id).
pub struct Slicer {
    partial: BTreeMap<(u16, u8), PartialSlice>,
    ready: VecDeque<DataSet>,
}

impl Default for Slicer {
    fn default() -> Self {
        Self::new()
    }
}

impl Slicer {
    pub fn new() -> Self {
        Self { partial: BTreeMap::new(), ready: VecDeque::new() }
    }

    /// Appends a block to the slice of its source, closing the previous
    /// slice on a timeframe change. Returns the size of the slice the
    /// block went into, or `None` for an invalid link id (block dropped).
    ///
    /// An undefined link id groups all undefined-link traffic of an
    /// equipment into a single slice per timeframe.
    pub fn append_block(&mut self, block: DataBlockRef, timestamp: f64) -> Option<usize> {
        let header = block.header();
        let link_id = header.link_id;
        if link_id != UNDEFINED_LINK_ID && link_id > RDH_MAX_LINK_ID {
            return None;
        }
        let tf_id = header.timeframe_id;
        let key = (header.equipment_id, link_id);

        let slice = self.partial.entry(key).or_insert_with(|| PartialSlice {
            tf_id,
            last_update: timestamp,
            set: DataSet::new(),
        });
        if !slice.set.is_empty() && (slice.tf_id != tf_id || tf_id == UNDEFINED_TIMEFRAME_ID) {
            self.ready.push_back(std::mem::take(&mut slice.set));
        }
        slice.tf_id = tf_id;
        slice.last_update = timestamp;
        slice.set.push(block);
        Some(slice.set.len())
    }

    /// Oldest completed slice, if any; with `include_incomplete`, falls
    /// back to a currently open slice.
    pub fn get_slice(&mut self, include_incomplete: bool) -> Option<DataSet> {
        if let Some(set) = self.ready.pop_front() {
            return Some(set);
        }
        if include_incomplete {
            for slice in self.partial.values_mut() {
                if !slice.set.is_empty() {
                    return Some(std::mem::take(&mut slice.set));
                }
            }
        }
        None
    }

    /// Moves slices not updated since `cutoff` to the ready queue.
    pub fn complete_on_timeout(&mut self, cutoff: f64) -> usize {
        let mut flushed = 0;
        for slice in self.partial.values_mut() {
            if !slice.set.is_empty() && slice.last_update <= cutoff {
                self.ready.push_back(std::mem::take(&mut slice.set));
                flushed += 1;
            }
        }
        flushed
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.ready.clear();
    }
}

/// Counters shared between the aggregator worker and the control side.
#[derive(Default)]
pub struct AggregatorCounters {
    pub total_blocks_in: AtomicU64,
    pub total_sets_out: AtomicU64,
    pub invalid_link_blocks: AtomicU64,
    pub late_slices_discarded: AtomicU64,
    pub timeframes_out: AtomicU64,
    /// Number of sources observed in the first completed timeframe.
    pub n_sources: AtomicU64,
}

struct SubTimeframe {
    source_id: u64,
    set: DataSet,
}

struct TimeframeEntry {
    sub_timeframes: Vec<SubTimeframe>,
    update_time: f64,
}

struct AggregatorWorker {
    config: AggregatorConfig,
    inputs: Vec<Arc<Fifo<DataBlockRef>>>,
    output: Arc<Fifo<DataSet>>,
    slicers: Vec<Slicer>,
    counters: Arc<AggregatorCounters>,
    stats: Arc<DaqStats>,
    flush: Arc<AtomicBool>,
    next_index: usize,
    tf_buffer: BTreeMap<u64, TimeframeEntry>,
    last_tf_emitted: u64,
    epoch: Instant,
    link_warned: bool,
}

impl AggregatorWorker {
    fn push_output(&self, set: DataSet) {
        for block in &set {
            block.set_page_state(PageState::InAggregatorFifoOut);
        }
        self.counters.total_sets_out.fetch_add(1, Ordering::Relaxed);
        self.stats.subtimeframes.fetch_add(1, Ordering::Relaxed);
        if self.output.push(set).is_err() {
            // single producer: callers check for space before pushing
            warn!("aggregator output overflow, data set dropped");
        }
    }

    /// Files one slice into the timeframe buffer; slices for already
    /// emitted timeframes are discarded.
    fn buffer_slice(&mut self, set: DataSet, now: f64) {
        let header = set[0].header();
        let tf_id = header.timeframe_id;
        let source_id = ((header.equipment_id as u64) << 32) | header.link_id as u64;
        if tf_id <= self.last_tf_emitted {
            self.counters.late_slices_discarded.fetch_add(1, Ordering::Relaxed);
            warn!("discarding late data for timeframe {} (source {:#x})", tf_id, source_id);
            return;
        }
        let entry = self.tf_buffer.entry(tf_id).or_insert_with(|| TimeframeEntry {
            sub_timeframes: Vec::new(),
            update_time: now,
        });
        entry.sub_timeframes.push(SubTimeframe { source_id, set });
        entry.update_time = now;
    }

    /// Emits, in ascending id order, every buffered timeframe whose age
    /// exceeds the completion timeout.
    fn drain_timeframes(&mut self, now: f64) -> usize {
        let mut emitted = 0;
        while let Some((&tf_id, entry)) = self.tf_buffer.iter().next() {
            if now - entry.update_time < self.config.tf_timeout {
                break;
            }
            if self.output.free_slots() < entry.sub_timeframes.len() {
                // not enough room for the whole timeframe; retry later
                break;
            }
            let entry = self.tf_buffer.remove(&tf_id).expect("entry just observed");
            let n_sub = entry.sub_timeframes.len();
            if self.counters.timeframes_out.load(Ordering::Relaxed) == 0 {
                self.counters.n_sources.store(n_sub as u64, Ordering::Relaxed);
                info!("first timeframe completed with {} source(s)", n_sub);
            }
            for (ix, sub) in entry.sub_timeframes.into_iter().enumerate() {
                if ix + 1 == n_sub {
                    if let Some(last) = sub.set.last() {
                        last.set_end_of_timeframe();
                    }
                }
                self.push_output(sub.set);
            }
            self.counters.timeframes_out.fetch_add(1, Ordering::Relaxed);
            self.last_tf_emitted = tf_id;
            emitted += 1;
        }
        emitted
    }

    fn execute(&mut self) -> LoopStatus {
        if self.output.is_full() {
            return LoopStatus::Idle;
        }

        let n_inputs = self.inputs.len();
        let mut blocks_in = 0usize;
        let mut sets_out = 0usize;
        let now = self.epoch.elapsed().as_secs_f64();
        let flushing = self.flush.load(Ordering::Acquire);

        for ix in 0..n_inputs {
            // rotate the starting input so later sources are not starved
            let i = (ix + self.next_index) % n_inputs;

            if self.config.disable_slicing {
                if self.output.is_full() {
                    return LoopStatus::Idle;
                }
                let Some(block) = self.inputs[i].pop() else { continue };
                blocks_in += 1;
                self.counters.total_blocks_in.fetch_add(1, Ordering::Relaxed);
                self.push_output(vec![block]);
                sets_out += 1;
                continue;
            }

            for _ in 0..MAX_LOOP {
                let Some(block) = self.inputs[i].pop() else { break };
                blocks_in += 1;
                self.counters.total_blocks_in.fetch_add(1, Ordering::Relaxed);
                block.set_page_state(PageState::InAggregator);
                if self.slicers[i].append_block(block, now).is_none() {
                    self.counters.invalid_link_blocks.fetch_add(1, Ordering::Relaxed);
                    if !self.link_warned {
                        warn!("input {}: block with link id > {} rejected", i, RDH_MAX_LINK_ID);
                        self.link_warned = true;
                    }
                }
            }

            if self.config.slice_timeout > 0.0 {
                self.slicers[i].complete_on_timeout(now - self.config.slice_timeout);
            }

            for _ in 0..MAX_LOOP {
                if self.output.is_full() {
                    return LoopStatus::Idle;
                }
                let include_incomplete = flushing && self.inputs[i].is_empty();
                let Some(set) = self.slicers[i].get_slice(include_incomplete) else { break };
                if self.config.tf_building_enabled() {
                    self.buffer_slice(set, now);
                } else {
                    self.push_output(set);
                }
                sets_out += 1;
                self.next_index = i + 1;
            }
        }

        if self.config.tf_building_enabled() {
            let effective_now = if flushing { f64::INFINITY } else { now };
            sets_out += self.drain_timeframes(effective_now);
        }

        if flushing && !self.tf_buffer.is_empty() {
            // flushed timeframes may still be waiting for output space
            return LoopStatus::Ok;
        }

        if blocks_in == 0 && sets_out == 0 {
            if flushing && self.tf_buffer.is_empty() {
                // flush complete once nothing is pending anywhere
                self.flush.store(false, Ordering::Release);
            }
            return LoopStatus::Idle;
        }
        LoopStatus::Ok
    }
}

/// Single consumer of all equipment outputs; producer of data sets for
/// the consumer fan-out.
pub struct Aggregator {
    config: AggregatorConfig,
    inputs: Vec<Arc<Fifo<DataBlockRef>>>,
    output: Arc<Fifo<DataSet>>,
    counters: Arc<AggregatorCounters>,
    stats: Arc<DaqStats>,
    flush: Arc<AtomicBool>,
    worker: Option<Arc<Mutex<AggregatorWorker>>>,
    thread: Option<LoopThread>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, ctx: &PipelineContext) -> Self {
        let output = Arc::new(Fifo::new(config.output_fifo_size));
        Self {
            config,
            inputs: Vec::new(),
            output,
            counters: Arc::new(AggregatorCounters::default()),
            stats: ctx.stats.clone(),
            flush: Arc::new(AtomicBool::new(false)),
            worker: None,
            thread: None,
        }
    }

    /// Registers one equipment output as an input. Must be called before
    /// `start`.
    pub fn add_input(&mut self, input: Arc<Fifo<DataBlockRef>>) {
        self.inputs.push(input);
    }

    pub fn output(&self) -> Arc<Fifo<DataSet>> {
        self.output.clone()
    }

    pub fn counters(&self) -> Arc<AggregatorCounters> {
        self.counters.clone()
    }

    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        info!(
            "aggregator: {} input(s), slicing {}, timeframe building {}",
            self.inputs.len(),
            if self.config.disable_slicing { "off" } else { "on" },
            if self.config.tf_building_enabled() { "on" } else { "off" },
        );
        self.flush.store(false, Ordering::Release);
        let worker = Arc::new(Mutex::new(AggregatorWorker {
            config: self.config.clone(),
            inputs: self.inputs.clone(),
            output: self.output.clone(),
            slicers: self.inputs.iter().map(|_| Slicer::new()).collect(),
            counters: self.counters.clone(),
            stats: self.stats.clone(),
            flush: self.flush.clone(),
            next_index: 0,
            tf_buffer: BTreeMap::new(),
            last_tf_emitted: UNDEFINED_TIMEFRAME_ID,
            epoch: Instant::now(),
            link_warned: false,
        }));
        let w = worker.clone();
        self.thread = Some(LoopThread::start("aggregator", self.config.idle_sleep, move || {
            w.lock().expect("aggregator worker mutex poisoned").execute()
        }));
        self.worker = Some(worker);
    }

    /// Requests completion of everything in flight, including partial
    /// slices once their input is empty; waits until done or `timeout`.
    pub fn flush_and_wait(&self, timeout: Duration) {
        self.flush.store(true, Ordering::Release);
        let t0 = Instant::now();
        while self.flush.load(Ordering::Acquire) && t0.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
        if let Some(worker) = self.worker.take() {
            let mut w = worker.lock().expect("aggregator worker mutex poisoned");
            for slicer in &mut w.slicers {
                slicer.reset();
            }
            w.tf_buffer.clear();
        }
        for input in &self.inputs {
            input.clear();
        }
        self.output.clear();
        info!(
            "aggregator processed {} blocks, emitted {} sets ({} timeframes, {} late slices discarded)",
            self.counters.total_blocks_in.load(Ordering::Relaxed),
            self.counters.total_sets_out.load(Ordering::Relaxed),
            self.counters.timeframes_out.load(Ordering::Relaxed),
            self.counters.late_slices_discarded.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::memory::{BankManager, MemoryBank, PagePool, PoolSpec};

    fn pool(pages: usize) -> Arc<PagePool> {
        let mgr = BankManager::new();
        mgr.add_bank(
            Arc::new(MemoryBank::new_malloc((pages + 2) * 1024, "agg").unwrap()),
            "agg",
        );
        mgr.create_pool(&PoolSpec {
            page_size: 1024,
            page_count: pages,
            bank_name: None,
            block_align: 0,
            first_page_offset: 0,
            pool_id: 0,
        })
        .unwrap()
    }

    fn block(pool: &Arc<PagePool>, equipment: u16, link: u8, tf: u64, block_id: u64) -> DataBlockRef {
        let mut b = pool.new_data_block(None).expect("pool exhausted in test");
        *b.header_mut() = BlockHeader {
            data_size: 64,
            block_id,
            equipment_id: equipment,
            link_id: link,
            timeframe_id: tf,
            ..BlockHeader::default()
        };
        Arc::new(b)
    }

    #[test]
    fn slicer_groups_by_timeframe() {
        let pool = pool(16);
        let mut slicer = Slicer::new();
        slicer.append_block(block(&pool, 1, 0, 1, 1), 0.0).unwrap();
        slicer.append_block(block(&pool, 1, 0, 1, 2), 0.0).unwrap();
        assert!(slicer.get_slice(false).is_none());
        // timeframe change closes the slice
        slicer.append_block(block(&pool, 1, 0, 2, 3), 0.0).unwrap();
        let slice = slicer.get_slice(false).unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].header().block_id, 1);
        assert_eq!(slice[1].header().block_id, 2);
    }

    #[test]
    fn slicer_keeps_links_separate() {
        let pool = pool(16);
        let mut slicer = Slicer::new();
        slicer.append_block(block(&pool, 1, 5, 1, 1), 0.0).unwrap();
        slicer.append_block(block(&pool, 1, 7, 1, 2), 0.0).unwrap();
        slicer.append_block(block(&pool, 1, 5, 2, 3), 0.0).unwrap();
        let slice = slicer.get_slice(false).unwrap();
        assert_eq!(slice.len(), 1);
        assert_eq!(slice[0].header().link_id, 5);
    }

    #[test]
    fn slicer_rejects_invalid_link() {
        let pool = pool(16);
        let mut slicer = Slicer::new();
        assert!(slicer.append_block(block(&pool, 1, 40, 1, 1), 0.0).is_none());
    }

    #[test]
    fn slicer_timeout_closes_partial() {
        let pool = pool(16);
        let mut slicer = Slicer::new();
        slicer.append_block(block(&pool, 1, 0, 1, 1), 10.0).unwrap();
        assert_eq!(slicer.complete_on_timeout(9.0), 0);
        assert_eq!(slicer.complete_on_timeout(10.5), 1);
        assert_eq!(slicer.get_slice(false).unwrap().len(), 1);
    }

    #[test]
    fn undefined_timeframe_closes_every_block() {
        let pool = pool(16);
        let mut slicer = Slicer::new();
        slicer.append_block(block(&pool, 1, 0, 0, 1), 0.0).unwrap();
        slicer.append_block(block(&pool, 1, 0, 0, 2), 0.0).unwrap();
        assert_eq!(slicer.get_slice(false).unwrap().len(), 1);
    }

    fn run_aggregator(
        config: AggregatorConfig,
        feeds: Vec<Vec<DataBlockRef>>,
        settle: Duration,
    ) -> (Vec<DataSet>, Arc<AggregatorCounters>) {
        let ctx = PipelineContext::new();
        let mut agg = Aggregator::new(config, &ctx);
        let inputs: Vec<Arc<Fifo<DataBlockRef>>> =
            feeds.iter().map(|_| Arc::new(Fifo::new(256))).collect();
        for input in &inputs {
            agg.add_input(input.clone());
        }
        agg.start();
        for (input, blocks) in inputs.iter().zip(feeds) {
            for b in blocks {
                input.push(b).unwrap();
            }
        }
        std::thread::sleep(settle);
        agg.flush_and_wait(Duration::from_secs(2));
        let out = agg.output();
        let mut sets = Vec::new();
        while let Some(set) = out.pop() {
            sets.push(set);
        }
        let counters = agg.counters();
        agg.stop();
        (sets, counters)
    }

    #[test]
    fn direct_path_preserves_source_order() {
        let pool = pool(32);
        let feed: Vec<_> = (1..=6).map(|i| block(&pool, 1, 0, i, i)).collect();
        let (sets, counters) = run_aggregator(
            AggregatorConfig::default(),
            vec![feed],
            Duration::from_millis(50),
        );
        assert_eq!(counters.total_blocks_in.load(Ordering::Relaxed), 6);
        let ids: Vec<u64> = sets.iter().flatten().map(|b| b.header().block_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn timeframes_emitted_in_increasing_order_with_eotf() {
        let pool = pool(64);
        // two sources, interleaved links 5 and 7, two blocks per TF
        let mut feed_a = Vec::new();
        let mut feed_b = Vec::new();
        let mut id = 0;
        for tf in 1..=5u64 {
            for _ in 0..2 {
                id += 1;
                feed_a.push(block(&pool, 1, 5, tf, id));
                id += 1;
                feed_b.push(block(&pool, 2, 7, tf, id));
            }
        }
        let config = AggregatorConfig {
            tf_timeout: 0.05,
            ..AggregatorConfig::default()
        };
        let (sets, counters) = run_aggregator(config, vec![feed_a, feed_b], Duration::from_millis(150));

        assert_eq!(counters.timeframes_out.load(Ordering::Relaxed), 5);
        assert_eq!(counters.n_sources.load(Ordering::Relaxed), 2);
        // each timeframe contributes one set per source
        assert_eq!(sets.len(), 10);

        let mut last_tf = 0u64;
        let mut eotf_per_tf: BTreeMap<u64, usize> = BTreeMap::new();
        for set in &sets {
            let tf = set[0].header().timeframe_id;
            assert!(tf >= last_tf, "timeframe order violated: {} after {}", tf, last_tf);
            last_tf = tf;
            assert_eq!(set.len(), 2);
            // blocks within a set come from a single source
            let eq = set[0].header().equipment_id;
            assert!(set.iter().all(|b| b.header().equipment_id == eq));
            for b in set {
                if b.end_of_timeframe() {
                    *eotf_per_tf.entry(tf).or_default() += 1;
                }
            }
        }
        // exactly one end-of-timeframe block per emitted timeframe
        assert_eq!(eotf_per_tf.len(), 5);
        assert!(eotf_per_tf.values().all(|&n| n == 1));
    }

    #[test]
    fn late_source_and_discarded_slices() {
        let pool = pool(64);
        // A delivers TFs 1..=5, B only 3..=5
        let feed_a: Vec<_> = (1..=5u64).map(|tf| block(&pool, 1, 1, tf, tf)).collect();
        let feed_b: Vec<_> = (3..=5u64).map(|tf| block(&pool, 2, 2, tf, 10 + tf)).collect();
        let config = AggregatorConfig {
            slice_timeout: 0.05,
            tf_timeout: 0.05,
            ..AggregatorConfig::default()
        };
        let ctx = PipelineContext::new();
        let mut agg = Aggregator::new(config, &ctx);
        let in_a = Arc::new(Fifo::new(64));
        let in_b = Arc::new(Fifo::new(64));
        agg.add_input(in_a.clone());
        agg.add_input(in_b.clone());
        agg.start();
        for b in feed_a {
            in_a.push(b).unwrap();
        }
        for b in feed_b {
            in_b.push(b).unwrap();
        }
        // wait for the completion timeouts to elapse
        std::thread::sleep(Duration::from_millis(200));

        // belated slice for an already-emitted timeframe gets discarded
        in_b.push(block(&pool, 2, 2, 2, 99)).unwrap();
        // followed by a fresh timeframe so the slicer closes the late one
        in_b.push(block(&pool, 2, 2, 6, 100)).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let out = agg.output();
        let mut per_tf: BTreeMap<u64, usize> = BTreeMap::new();
        while let Some(set) = out.pop() {
            *per_tf.entry(set[0].header().timeframe_id).or_default() += 1;
        }
        let counters = agg.counters();
        let discarded = counters.late_slices_discarded.load(Ordering::Relaxed);
        agg.stop();

        assert_eq!(per_tf.get(&1), Some(&1));
        assert_eq!(per_tf.get(&2), Some(&1));
        assert_eq!(per_tf.get(&3), Some(&2));
        assert_eq!(per_tf.get(&4), Some(&2));
        assert_eq!(per_tf.get(&5), Some(&2));
        assert_eq!(discarded, 1);
    }

    #[test]
    fn backpressure_leaves_blocks_queued() {
        let pool = pool(32);
        let feed: Vec<_> = (1..=20u64).map(|i| block(&pool, 1, 0, i, i)).collect();
        let config = AggregatorConfig {
            output_fifo_size: 4,
            ..AggregatorConfig::default()
        };
        let ctx = PipelineContext::new();
        let mut agg = Aggregator::new(config, &ctx);
        let input = Arc::new(Fifo::new(64));
        agg.add_input(input.clone());
        agg.start();
        for b in feed {
            input.push(b).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));
        // output full: the aggregator idles instead of dropping
        assert_eq!(agg.output().len(), 4);
        // draining the output lets the rest flow
        let out = agg.output();
        let mut seen = 0;
        let t0 = Instant::now();
        while seen < 19 && t0.elapsed() < Duration::from_secs(2) {
            if out.pop().is_some() {
                seen += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(seen, 19);
        agg.stop();
    }

    #[test]
    fn slicing_plus_tf_building_combination_rejected() {
        let mut cfg = ConfigMap::new();
        cfg.set("readout", "disableAggregatorSlicing", "1");
        cfg.set("readout", "aggregatorStfTimeout", "0.5");
        assert!(AggregatorConfig::from_config(&cfg).is_err());
    }
}
