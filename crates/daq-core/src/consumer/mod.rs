//! Sinks and their fan-out.
//!
//! A [`Consumer`] receives data sets from the aggregator. The [`Fanout`]
//! drives an ordered list of consumers from its own thread, applying
//! per-consumer link/equipment filters and forward chains, and surfacing
//! per-consumer errors to run control.

mod file_recorder;
mod processor;
mod stats_consumer;

pub use file_recorder::FileRecorder;
pub use processor::ZstdProcessor;
pub use stats_consumer::StatsConsumer;

use crate::block::{BlockHeader, DataSet};
use crate::config::{ConfigError, ConfigMap};
use crate::fifo::Fifo;
use crate::memory::PageState;
use crate::pipeline::PipelineContext;
use crate::thread::{LoopStatus, LoopThread};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
pub enum ConsumerError {
    Io(io::Error),
    Config(ConfigError),
    Failed(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Io(e) => write!(f, "consumer I/O error: {}", e),
            ConsumerError::Config(e) => write!(f, "consumer configuration error: {}", e),
            ConsumerError::Failed(msg) => write!(f, "consumer error: {}", msg),
        }
    }
}

impl std::error::Error for ConsumerError {}

impl From<io::Error> for ConsumerError {
    fn from(e: io::Error) -> Self {
        ConsumerError::Io(e)
    }
}

impl From<ConfigError> for ConsumerError {
    fn from(e: ConfigError) -> Self {
        ConsumerError::Config(e)
    }
}

/// A sink for data sets.
pub trait Consumer: Send {
    fn name(&self) -> &str;

    /// Called just before data starts flowing; resets counters.
    fn start(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Called after the last `push_set`; logs totals.
    fn stop(&mut self) {}

    /// Delivers one data set; returns the number of blocks accepted.
    fn push_set(&mut self, set: &DataSet) -> Result<usize, ConsumerError>;

    /// For processor sinks: the transformed set to hand to the forward
    /// consumer, produced by the last `push_set`.
    fn take_forward_output(&mut self) -> Option<DataSet> {
        None
    }
}

/// Per-block include/exclude filter on link id and equipment id.
/// Excludes are applied first; a non-empty include list must then match.
#[derive(Debug, Default, Clone)]
pub struct BlockFilter {
    pub links_include: Vec<i64>,
    pub links_exclude: Vec<i64>,
    pub equipment_include: Vec<i64>,
    pub equipment_exclude: Vec<i64>,
}

impl BlockFilter {
    pub fn from_config(cfg: &ConfigMap, section: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            links_include: cfg.get_int_list(section, "filterLinksInclude")?,
            links_exclude: cfg.get_int_list(section, "filterLinksExclude")?,
            equipment_include: cfg.get_int_list(section, "filterEquipmentIdsInclude")?,
            equipment_exclude: cfg.get_int_list(section, "filterEquipmentIdsExclude")?,
        })
    }

    pub fn is_active(&self) -> bool {
        !(self.links_include.is_empty()
            && self.links_exclude.is_empty()
            && self.equipment_include.is_empty()
            && self.equipment_exclude.is_empty())
    }

    pub fn accepts(&self, header: &BlockHeader) -> bool {
        let link = header.link_id as i64;
        if self.links_exclude.contains(&link) {
            return false;
        }
        if !self.links_include.is_empty() && !self.links_include.contains(&link) {
            return false;
        }
        let eq = header.equipment_id as i64;
        if self.equipment_exclude.contains(&eq) {
            return false;
        }
        if !self.equipment_include.is_empty() && !self.equipment_include.contains(&eq) {
            return false;
        }
        true
    }

    /// Applies the filter block-by-block; `None` when nothing passes.
    fn filter_set(&self, set: &DataSet) -> Option<DataSet> {
        if !self.is_active() {
            return Some(set.clone());
        }
        let filtered: DataSet = set.iter().filter(|b| self.accepts(b.header())).cloned().collect();
        if filtered.is_empty() { None } else { Some(filtered) }
    }
}

/// One consumer in the fan-out list.
pub struct ConsumerSlot {
    pub consumer: Box<dyn Consumer>,
    pub filter: BlockFilter,
    pub stop_on_error: bool,
    /// Index of the consumer receiving this consumer's forward output.
    pub forward_to: Option<usize>,
    /// Set on consumers that are a forward target: they only receive
    /// forwarded sets, never the aggregator output directly.
    pub forward_only: bool,
    push_success: u64,
    push_error: u64,
}

impl ConsumerSlot {
    pub fn new(consumer: Box<dyn Consumer>) -> Self {
        Self {
            consumer,
            filter: BlockFilter::default(),
            stop_on_error: false,
            forward_to: None,
            forward_only: false,
            push_success: 0,
            push_error: 0,
        }
    }

    pub fn with_filter(mut self, filter: BlockFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn with_forward_to(mut self, target: Option<usize>) -> Self {
        self.forward_to = target;
        self
    }
}

struct FanoutWorker {
    input: Arc<Fifo<DataSet>>,
    slots: Vec<ConsumerSlot>,
    stop_flag: Arc<AtomicBool>,
}

impl FanoutWorker {
    fn deliver(&mut self, index: usize, set: &DataSet) {
        let Some(filtered) = self.slots[index].filter.filter_set(set) else {
            return;
        };
        match self.slots[index].consumer.push_set(&filtered) {
            Ok(_) => self.slots[index].push_success += 1,
            Err(e) => {
                self.slots[index].push_error += 1;
                warn!("consumer {}: push failed: {}", self.slots[index].consumer.name(), e);
                if self.slots[index].stop_on_error {
                    self.stop_flag.store(true, Ordering::Release);
                }
                return;
            }
        }
        // forward chain: a processor's output goes to its target consumer
        if let Some(target) = self.slots[index].forward_to {
            if let Some(output) = self.slots[index].consumer.take_forward_output() {
                if target < self.slots.len() && target != index {
                    self.deliver(target, &output);
                }
            }
        }
    }

    fn step(&mut self) -> LoopStatus {
        let Some(set) = self.input.pop() else {
            return LoopStatus::Idle;
        };
        for block in &set {
            block.set_page_state(PageState::InConsumer);
        }
        for i in 0..self.slots.len() {
            if self.slots[i].forward_only {
                continue;
            }
            self.deliver(i, &set);
        }
        LoopStatus::Ok
    }
}

/// Drives the aggregator output through the ordered consumer list.
pub struct Fanout {
    worker: Arc<Mutex<FanoutWorker>>,
    thread: Option<LoopThread>,
    idle_sleep: Duration,
}

impl Fanout {
    pub fn new(input: Arc<Fifo<DataSet>>, slots: Vec<ConsumerSlot>, ctx: &PipelineContext) -> Self {
        Self {
            worker: Arc::new(Mutex::new(FanoutWorker {
                input,
                slots,
                stop_flag: ctx.stop_flag(),
            })),
            thread: None,
            idle_sleep: Duration::from_micros(1000),
        }
    }

    /// Starts all consumers (in list order), then the delivery thread.
    pub fn start(&mut self) -> Result<(), ConsumerError> {
        if self.thread.is_some() {
            return Ok(());
        }
        {
            let mut w = self.worker.lock().expect("fanout worker mutex poisoned");
            for slot in &mut w.slots {
                slot.push_success = 0;
                slot.push_error = 0;
                slot.consumer.start()?;
            }
        }
        let worker = self.worker.clone();
        self.thread = Some(LoopThread::start("consumer-fanout", self.idle_sleep, move || {
            worker.lock().expect("fanout worker mutex poisoned").step()
        }));
        Ok(())
    }

    /// Drains the delivery thread and stops every consumer.
    pub fn stop(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
        let mut w = self.worker.lock().expect("fanout worker mutex poisoned");
        for slot in &mut w.slots {
            info!(
                "consumer {}: push statistics: {} ok / {} errors",
                slot.consumer.name(),
                slot.push_success,
                slot.push_error
            );
            slot.consumer.stop();
        }
    }

    /// (push successes, push errors) per consumer, in list order.
    pub fn push_counters(&self) -> Vec<(u64, u64)> {
        self.worker
            .lock()
            .expect("fanout worker mutex poisoned")
            .slots
            .iter()
            .map(|s| (s.push_success, s.push_error))
            .collect()
    }
}

/// Builds a consumer from its config section, choosing the kind from
/// `consumerType` (fileRecorder | stats | zstd).
pub fn create_consumer(
    cfg: &ConfigMap,
    section: &str,
    ctx: &PipelineContext,
) -> Result<Box<dyn Consumer>, ConsumerError> {
    let kind = cfg
        .get_str(section, "consumerType")
        .ok_or_else(|| ConfigError::Missing { section: section.into(), key: "consumerType".into() })?;
    match kind {
        "fileRecorder" => Ok(Box::new(FileRecorder::from_config(cfg, section, ctx)?)),
        "stats" => Ok(Box::new(StatsConsumer::from_config(cfg, section, ctx)?)),
        "zstd" => Ok(Box::new(ZstdProcessor::from_config(cfg, section, ctx)?)),
        other => Err(ConsumerError::Config(ConfigError::BadValue {
            section: section.into(),
            key: "consumerType".into(),
            value: other.into(),
            expected: "fileRecorder | stats | zstd",
        })),
    }
}
