//! Equipments: one producer per data source.
//!
//! An equipment owns a page pool, a dedicated loop thread and an output
//! FIFO. Each iteration it pulls filled blocks from its source, stamps
//! and validates them, applies the timeframe admission rate, and pushes
//! them downstream. Sources (generator, emulator, file player) implement
//! [`DataSource`].

mod driver;
mod emulator;
mod generator;
mod player;

pub use driver::{DriverChannel, DriverSource};
pub use emulator::EmulatorSource;
pub use generator::GeneratorSource;
pub use player::PlayerSource;

use crate::block::{
    DataBlock, DataBlockRef, UNDEFINED_EQUIPMENT_ID, UNDEFINED_LINK_ID, UNDEFINED_TIMEFRAME_ID,
};
use crate::config::{ConfigError, ConfigMap};
use crate::fifo::Fifo;
use crate::memory::{BankManagerError, PagePool, PageState, PoolSpec};
use crate::pipeline::PipelineContext;
use crate::rate::RateRegulator;
use crate::rdh::{RDH_MAX_LINK_ID, RDH_SIZE, RdhPacketIter, RdhView};
use crate::stats::DaqStats;
use crate::tfclock::{SoftwareTfClock, TimeframeClock};
use crate::thread::{LoopStatus, LoopThread};
use crate::util::{CounterStats, LogToken, format_bytes};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum EquipmentError {
    Config(ConfigError),
    Pool(BankManagerError),
    Source(String),
}

impl fmt::Display for EquipmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EquipmentError::Config(e) => write!(f, "equipment configuration error: {}", e),
            EquipmentError::Pool(e) => write!(f, "equipment pool error: {}", e),
            EquipmentError::Source(msg) => write!(f, "equipment source error: {}", msg),
        }
    }
}

impl std::error::Error for EquipmentError {}

impl From<ConfigError> for EquipmentError {
    fn from(e: ConfigError) -> Self {
        EquipmentError::Config(e)
    }
}

impl From<BankManagerError> for EquipmentError {
    fn from(e: BankManagerError) -> Self {
        EquipmentError::Pool(e)
    }
}

/// A source of filled data pages behind an equipment.
pub trait DataSource: Send + 'static {
    fn start(&mut self) -> Result<(), EquipmentError> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Hands free pages to the underlying driver / generates pending
    /// data. Called once per loop iteration while data taking is on.
    fn prepare(&mut self, _pool: &Arc<PagePool>) -> LoopStatus {
        LoopStatus::Idle
    }

    /// Pulls the next filled block; `None` when nothing is ready.
    fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError>;
}

/// Per-equipment configuration, read from one `equipment-*` section.
#[derive(Debug, Clone)]
pub struct EquipmentConfig {
    pub name: String,
    pub id: u16,
    /// Block rate cap in Hz, unlimited when <= 0.
    pub rate: f64,
    pub idle_sleep: Duration,
    /// Output FIFO length; 0 means "same as pool size".
    pub output_fifo_size: usize,
    pub memory_bank_name: Option<String>,
    pub memory_pool_page_size: usize,
    pub memory_pool_number_of_pages: usize,
    pub block_align: usize,
    pub first_page_offset: usize,
    pub disable_output: bool,
    pub stop_on_error: bool,
    pub debug_first_pages: u64,
    pub console_stats_update_time: f64,
    pub rdh_check_enabled: bool,
    pub rdh_use_first_in_page: bool,
    pub rdh_check_first_orbit: bool,
    pub tf_period_orbits: u32,
    pub tf_rate_limit: f64,
    pub disable_timeframes: bool,
    pub save_error_pages_max: u64,
    pub save_error_pages_path: PathBuf,
    pub drop_empty_hb_frames: bool,
}

impl EquipmentConfig {
    /// Parses one `equipment-*` section. `is_rdh_equipment` flips the
    /// defaults for sources that produce packet-header framed data.
    pub fn from_config(
        cfg: &ConfigMap,
        section: &str,
        is_rdh_equipment: bool,
    ) -> Result<Self, ConfigError> {
        let name = cfg.get_str_or(section, "name", section);
        let id = cfg.get_i64_or(section, "id", UNDEFINED_EQUIPMENT_ID as i64)? as u16;
        let rate = cfg.get_f64_or("readout", "rate", -1.0)?;
        let idle_sleep = Duration::from_micros(cfg.get_i64_or(section, "idleSleepTime", 200)?.max(1) as u64);
        let page_size = cfg.get_bytes_or(section, "memoryPoolPageSize", 128 * 1024)? as usize;
        let page_count = cfg.get_i64_or(section, "memoryPoolNumberOfPages", 32)?.max(1) as usize;
        let output_fifo_size = match cfg.get_i64_or(section, "outputFifoSize", -1)? {
            v if v <= 0 => 0,
            v => v as usize,
        };
        Ok(Self {
            name,
            id,
            rate,
            idle_sleep,
            output_fifo_size,
            memory_bank_name: cfg.get_str(section, "memoryBankName").map(str::to_string),
            memory_pool_page_size: page_size,
            memory_pool_number_of_pages: page_count,
            block_align: cfg.get_bytes_or(section, "blockAlign", 2 * 1024 * 1024)? as usize,
            first_page_offset: cfg.get_bytes_or(section, "firstPageOffset", 0)? as usize,
            disable_output: cfg.get_bool_or(section, "disableOutput", false)?,
            stop_on_error: cfg.get_bool_or(section, "stopOnError", false)?,
            debug_first_pages: cfg.get_i64_or(section, "debugFirstPages", 0)?.max(0) as u64,
            console_stats_update_time: cfg.get_f64_or(section, "consoleStatsUpdateTime", 0.0)?,
            rdh_check_enabled: cfg.get_bool_or(section, "rdhCheckEnabled", false)?,
            rdh_use_first_in_page: cfg.get_bool_or(section, "rdhUseFirstInPageEnabled", is_rdh_equipment)?,
            rdh_check_first_orbit: cfg.get_bool_or(section, "rdhCheckFirstOrbit", true)?,
            tf_period_orbits: cfg.get_i64_or(section, "TFperiod", 128)?.max(1) as u32,
            tf_rate_limit: cfg.get_f64_or("readout", "tfRateLimit", 0.0)?,
            disable_timeframes: cfg.get_bool_or("readout", "disableTimeframes", false)?,
            save_error_pages_max: cfg.get_i64_or(section, "saveErrorPagesMax", 0)?.max(0) as u64,
            save_error_pages_path: PathBuf::from(cfg.get_str_or(section, "saveErrorPagesPath", ".")),
            drop_empty_hb_frames: cfg.get_bool_or(section, "dropEmptyHbFrames", false)?,
        })
    }
}

/// Runtime counters, shared between the worker thread and the control
/// side for end-of-run reporting.
#[derive(Default)]
pub struct EquipmentCounters {
    pub n_loop: AtomicU64,
    pub n_idle: AtomicU64,
    pub n_blocks_out: AtomicU64,
    pub n_bytes_out: AtomicU64,
    pub n_memory_low: AtomicU64,
    pub n_output_full: AtomicU64,
    pub n_throttle: AtomicU64,
    pub n_pages_used: AtomicU64,
    pub n_pages_free: AtomicU64,
    pub n_timeframes: AtomicU64,
    pub rdh_check_ok: AtomicU64,
    pub rdh_check_err: AtomicU64,
    pub rdh_stream_err: AtomicU64,
    pub saved_error_pages: AtomicU64,
    pub n_errors: AtomicU64,
    /// Bitmask of link ids seen in the data.
    pub links_used: AtomicU64,
    /// Payload bytes per link id.
    pub link_bytes: [AtomicU64; (RDH_MAX_LINK_ID + 1) as usize],
}

impl EquipmentCounters {
    fn reset(&self) {
        self.n_loop.store(0, Ordering::Relaxed);
        self.n_idle.store(0, Ordering::Relaxed);
        self.n_blocks_out.store(0, Ordering::Relaxed);
        self.n_bytes_out.store(0, Ordering::Relaxed);
        self.n_memory_low.store(0, Ordering::Relaxed);
        self.n_output_full.store(0, Ordering::Relaxed);
        self.n_throttle.store(0, Ordering::Relaxed);
        self.n_pages_used.store(0, Ordering::Relaxed);
        self.n_pages_free.store(0, Ordering::Relaxed);
        self.n_timeframes.store(0, Ordering::Relaxed);
        self.rdh_check_ok.store(0, Ordering::Relaxed);
        self.rdh_check_err.store(0, Ordering::Relaxed);
        self.rdh_stream_err.store(0, Ordering::Relaxed);
        self.saved_error_pages.store(0, Ordering::Relaxed);
        self.n_errors.store(0, Ordering::Relaxed);
        self.links_used.store(0, Ordering::Relaxed);
        for b in &self.link_bytes {
            b.store(0, Ordering::Relaxed);
        }
    }
}

/// Worker-side state, owned by the loop thread via a mutex (uncontended:
/// the control side only touches it between runs).
struct EquipmentWorker {
    config: EquipmentConfig,
    source: Box<dyn DataSource>,
    pool: Arc<PagePool>,
    output: Arc<Fifo<DataBlockRef>>,
    counters: Arc<EquipmentCounters>,
    stats: Arc<DaqStats>,
    data_on: Arc<AtomicBool>,
    run_number: Arc<AtomicU32>,
    stop_flag: Arc<AtomicBool>,

    current_block_id: u64,
    last_timeframe: u64,
    /// Blocks pushed per non-idle iteration.
    push_stats: CounterStats,
    tf_clock: TimeframeClock,
    software_clock: Option<SoftwareTfClock>,
    tf_regulator: RateRegulator,
    throttled_block: Option<DataBlock>,
    started_at: Instant,
    debug_pages_left: u64,
    rdh_error_token: LogToken,
    tf_gap_token: LogToken,
    console_stats_at: Option<Instant>,
}

impl EquipmentWorker {
    fn step(&mut self) -> LoopStatus {
        let mut is_active = false;
        self.counters.n_loop.fetch_add(1, Ordering::Relaxed);

        if let Some(clk) = self.software_clock.as_mut() {
            clk.tick();
        }

        // pool occupancy gauges
        let free = self.pool.available_pages() as u64;
        let total = self.pool.total_pages() as u64;
        self.counters.n_pages_free.store(free, Ordering::Relaxed);
        self.counters.n_pages_used.store(total - free, Ordering::Relaxed);

        // block budget for this iteration: bounded so that all loop duties
        // run regularly, further reduced by the block rate cap
        let mut max_blocks = 1024i64;
        if self.config.rate > 0.0 {
            let produced = self.counters.n_blocks_out.load(Ordering::Relaxed);
            let budget = (self.config.rate * self.started_at.elapsed().as_secs_f64()) as i64 - produced as i64;
            if budget <= 0 && produced > 0 {
                self.counters.n_throttle.fetch_add(1, Ordering::Relaxed);
                self.counters.n_idle.fetch_add(1, Ordering::Relaxed);
                return LoopStatus::Idle;
            }
            max_blocks = max_blocks.min(budget.max(1));
        }

        let mut pushed = 0u64;
        for _ in 0..max_blocks {
            if self.output.is_full() {
                self.counters.n_output_full.fetch_add(1, Ordering::Relaxed);
                break;
            }

            // a block parked by the timeframe throttle is already
            // processed and stamped; only fresh blocks go through
            // tagging and validation
            let block = if let Some(parked) = self.throttled_block.take() {
                parked
            } else {
                if !self.data_on.load(Ordering::Acquire) {
                    break;
                }
                let mut block = match self.source.next_block(&self.pool) {
                    Ok(Some(b)) => b,
                    Ok(None) => {
                        if self.pool.available_pages() == 0 {
                            self.counters.n_memory_low.fetch_add(1, Ordering::Relaxed);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("equipment {}: source error: {}", self.config.name, e);
                        self.counters.n_errors.fetch_add(1, Ordering::Relaxed);
                        if self.config.stop_on_error {
                            self.stop_flag.store(true, Ordering::Release);
                        }
                        break;
                    }
                };

                block.set_page_state(PageState::InEquipment);

                if (self.config.rdh_use_first_in_page || self.config.rdh_check_enabled)
                    && !self.process_rdh(&mut block)
                {
                    // page dropped (empty heartbeat frames)
                    continue;
                }

                // stamp origin and sequence
                let header = block.header_mut();
                if self.config.id != UNDEFINED_EQUIPMENT_ID {
                    header.equipment_id = self.config.id;
                }
                self.current_block_id += 1;
                header.block_id = self.current_block_id;
                if self.config.disable_timeframes {
                    header.timeframe_id = UNDEFINED_TIMEFRAME_ID;
                } else if header.timeframe_id == UNDEFINED_TIMEFRAME_ID {
                    header.timeframe_id = self.software_clock.as_ref().map(|c| c.current()).unwrap_or(1);
                }
                header.run_number = self.run_number.load(Ordering::Relaxed);
                block
            };

            // admission of a new timeframe into the pipeline
            let tf_id = block.header().timeframe_id;
            if tf_id > self.last_timeframe {
                if !self.tf_regulator.next() {
                    // park the block; memory stays accounted, downstream
                    // is not flooded
                    self.throttled_block = Some(block);
                    self.counters.n_throttle.fetch_add(1, Ordering::Relaxed);
                    is_active = false;
                    break;
                }
                self.counters.n_timeframes.fetch_add(1, Ordering::Relaxed);
                if self.last_timeframe != UNDEFINED_TIMEFRAME_ID
                    && tf_id != self.last_timeframe + 1
                    && self.tf_gap_token.ok()
                {
                    warn!(
                        "equipment {}: non-contiguous timeframe ids {} ... {}",
                        self.config.name, self.last_timeframe, tf_id
                    );
                }
                self.last_timeframe = tf_id;
            }

            let data_size = block.header().data_size as u64;
            let link_id = block.header().link_id;
            if link_id <= RDH_MAX_LINK_ID {
                self.counters.links_used.fetch_or(1 << link_id, Ordering::Relaxed);
                self.counters.link_bytes[link_id as usize].fetch_add(data_size, Ordering::Relaxed);
            }
            self.counters.n_bytes_out.fetch_add(data_size, Ordering::Relaxed);
            self.stats.bytes_readout.fetch_add(data_size, Ordering::Relaxed);

            if self.debug_pages_left > 0 {
                let h = block.header();
                debug!(
                    "equipment {} ({}) page {} link {} tf {} size {}",
                    self.config.name, h.equipment_id, h.block_id, h.link_id, h.timeframe_id, h.data_size
                );
                self.debug_pages_left -= 1;
            }

            pushed += 1;
            is_active = true;
            if self.config.disable_output {
                continue;
            }
            block.set_page_state(PageState::InEquipmentFifoOut);
            let block: DataBlockRef = Arc::new(block);
            if self.output.push(block).is_err() {
                // single producer: cannot happen after the is_full check
                self.counters.n_output_full.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.counters.n_blocks_out.fetch_add(pushed, Ordering::Relaxed);
        if pushed > 0 {
            self.push_stats.set(pushed);
        }

        if self.data_on.load(Ordering::Acquire) {
            match self.source.prepare(&self.pool) {
                LoopStatus::Ok => is_active = true,
                LoopStatus::Idle => {}
                other => return other,
            }
        }

        self.maybe_print_console_stats();

        if is_active {
            LoopStatus::Ok
        } else {
            self.counters.n_idle.fetch_add(1, Ordering::Relaxed);
            LoopStatus::Idle
        }
    }

    /// Tags the block from its first packet header and optionally walks
    /// the whole page validating every packet. Returns false when the
    /// block must be dropped.
    fn process_rdh(&mut self, block: &mut DataBlock) -> bool {
        let name = self.config.name.clone();

        if self.config.rdh_use_first_in_page {
            let tagged = match RdhView::parse(block.payload()) {
                Ok(rdh) if rdh.validate().is_ok() => {
                    let orbit = rdh.orbit();
                    let tf_id = self.tf_clock.tf_from_orbit(orbit);
                    let range = self.tf_clock.orbit_range(tf_id);
                    let system_id = rdh.system_id();
                    let fee_id = rdh.fee_id();
                    let equipment_id = rdh.equipment_id();
                    let link_id = rdh.link_id();
                    let h = block.header_mut();
                    h.timeframe_id = tf_id;
                    h.system_id = system_id;
                    h.fee_id = fee_id;
                    h.equipment_id = equipment_id;
                    h.link_id = link_id;
                    if let Some((min, max)) = range {
                        h.timeframe_orbit_first = min;
                        h.timeframe_orbit_last = max;
                    }
                    h.is_rdh_format = true;
                    true
                }
                _ => false,
            };
            if !tagged {
                if self.rdh_error_token.ok() {
                    warn!("equipment {}: first packet header in page is invalid", name);
                }
                let h = block.header_mut();
                h.timeframe_id = UNDEFINED_TIMEFRAME_ID;
                h.link_id = UNDEFINED_LINK_ID;
            }
        }

        let mut page_error = false;
        if self.config.rdh_check_enabled {
            let (orbit_first, orbit_last) = (
                block.header().timeframe_orbit_first,
                block.header().timeframe_orbit_last,
            );
            let mut page_link: Option<u8> = None;
            let payload = block.payload();
            let mut checked = 0usize;
            for (offset, rdh) in RdhPacketIter::new(payload) {
                checked += 1;
                if let Err(e) = rdh.validate() {
                    self.counters.rdh_check_err.fetch_add(1, Ordering::Relaxed);
                    page_error = true;
                    if self.rdh_error_token.ok() {
                        warn!("equipment {}: packet header #{} @ {:#x}: {}", name, checked, offset, e);
                    }
                    break;
                }
                self.counters.rdh_check_ok.fetch_add(1, Ordering::Relaxed);

                // link id must not change within a page
                match page_link {
                    None => page_link = Some(rdh.link_id()),
                    Some(l) if l != rdh.link_id() => {
                        self.counters.rdh_stream_err.fetch_add(1, Ordering::Relaxed);
                        page_error = true;
                        if self.rdh_error_token.ok() {
                            warn!(
                                "equipment {}: inconsistent link ids in page: {} != {}",
                                name,
                                l,
                                rdh.link_id()
                            );
                        }
                        break;
                    }
                    _ => {}
                }

                // no timeframe crossing inside a page
                if !self.config.disable_timeframes
                    && orbit_first != orbit_last
                    && !orbit_in_range(rdh.orbit(), orbit_first, orbit_last)
                {
                    self.counters.rdh_stream_err.fetch_add(1, Ordering::Relaxed);
                    page_error = true;
                    if self.rdh_error_token.ok() {
                        warn!(
                            "equipment {}: orbit {:#x} outside timeframe range [{:#x},{:#x}]",
                            name,
                            rdh.orbit(),
                            orbit_first,
                            orbit_last
                        );
                    }
                    break;
                }
            }
        }

        if page_error {
            self.save_error_page(block);
        }

        if self.config.drop_empty_hb_frames && !page_error && block.header().is_rdh_format {
            let only_empty = RdhPacketIter::new(block.payload())
                .all(|(_, rdh)| rdh.memory_size() as usize <= RDH_SIZE);
            if only_empty {
                return false;
            }
        }

        true
    }

    /// Persists a misbehaving page for forensics, up to the configured
    /// maximum per run.
    fn save_error_page(&mut self, block: &DataBlock) {
        let saved = self.counters.saved_error_pages.load(Ordering::Relaxed);
        if self.config.save_error_pages_max == 0 || saved >= self.config.save_error_pages_max {
            return;
        }
        self.counters.saved_error_pages.fetch_add(1, Ordering::Relaxed);
        let path = self
            .config
            .save_error_pages_path
            .join(format!("{}.errorpage.{}.raw", self.config.name, saved + 1));
        match std::fs::write(&path, block.payload()) {
            Ok(()) => info!(
                "equipment {}: saved page with errors to {} ({} bytes)",
                self.config.name,
                path.display(),
                block.header().data_size
            ),
            Err(e) => warn!("equipment {}: failed to save error page: {}", self.config.name, e),
        }
    }

    fn maybe_print_console_stats(&mut self) {
        let Some(deadline) = self.console_stats_at else { return };
        if Instant::now() < deadline {
            return;
        }
        self.console_stats_at =
            Some(deadline + Duration::from_secs_f64(self.config.console_stats_update_time));
        info!(
            "{}: blocksOut={} bytesOut={} outputFull={} memoryLow={} pagesFree={}/{}",
            self.config.name,
            self.counters.n_blocks_out.load(Ordering::Relaxed),
            self.counters.n_bytes_out.load(Ordering::Relaxed),
            self.counters.n_output_full.load(Ordering::Relaxed),
            self.counters.n_memory_low.load(Ordering::Relaxed),
            self.counters.n_pages_free.load(Ordering::Relaxed),
            self.pool.total_pages(),
        );
    }
}

fn orbit_in_range(orbit: u32, first: u32, last: u32) -> bool {
    if first <= last {
        orbit >= first && orbit <= last
    } else {
        // wrapped range
        orbit >= first || orbit <= last
    }
}

/// One producer: a data source with its pool, loop thread and output
/// queue.
pub struct Equipment {
    name: String,
    stop_on_error: bool,
    pool: Arc<PagePool>,
    output: Arc<Fifo<DataBlockRef>>,
    counters: Arc<EquipmentCounters>,
    data_on: Arc<AtomicBool>,
    worker: Arc<Mutex<EquipmentWorker>>,
    thread: Option<LoopThread>,
    idle_sleep: Duration,
    started_at: Instant,
}

impl Equipment {
    /// Builds the equipment from its config section: acquires the pool,
    /// creates the output FIFO and prepares (but does not start) the
    /// loop. Fatal on bad configuration, missing bank, or pool
    /// exhaustion.
    pub fn new(
        cfg: &ConfigMap,
        section: &str,
        ctx: &PipelineContext,
        source: Box<dyn DataSource>,
        is_rdh_equipment: bool,
    ) -> Result<Self, EquipmentError> {
        let config = EquipmentConfig::from_config(cfg, section, is_rdh_equipment)?;
        info!(
            "equipment {}: id={} rate={} Hz, pool {} pages x {}, bank {:?}",
            config.name,
            config.id,
            config.rate,
            config.memory_pool_number_of_pages,
            config.memory_pool_page_size,
            config.memory_bank_name,
        );

        let pool = ctx.banks.create_pool(&PoolSpec {
            page_size: config.memory_pool_page_size,
            page_count: config.memory_pool_number_of_pages,
            bank_name: config.memory_bank_name.clone(),
            block_align: config.block_align,
            first_page_offset: config.first_page_offset,
            pool_id: config.id as i32,
        })?;
        {
            let name = config.name.clone();
            let token = Mutex::new(LogToken::new(10, Duration::from_secs(60)));
            pool.set_warning_callback(
                move |msg| {
                    if token.lock().expect("log token mutex poisoned").ok() {
                        warn!("equipment {}: {}", name, msg);
                    }
                },
                0.9,
                0.8,
            );
        }

        let fifo_size = if config.output_fifo_size > 0 {
            config.output_fifo_size
        } else {
            pool.total_pages()
        };
        let output = Arc::new(Fifo::new(fifo_size));
        let counters = Arc::new(EquipmentCounters::default());
        let data_on = Arc::new(AtomicBool::new(false));

        let uses_software_clock = !config.rdh_use_first_in_page && !config.disable_timeframes;
        let tf_clock = TimeframeClock::new(
            &config.name,
            config.tf_period_orbits,
            ctx.stats.first_orbit.clone(),
            config.rdh_check_first_orbit,
        );

        let worker = EquipmentWorker {
            source,
            pool: pool.clone(),
            output: output.clone(),
            counters: counters.clone(),
            stats: ctx.stats.clone(),
            data_on: data_on.clone(),
            run_number: ctx.run_number_cell(),
            stop_flag: ctx.stop_flag(),
            current_block_id: 0,
            last_timeframe: UNDEFINED_TIMEFRAME_ID,
            push_stats: CounterStats::new(),
            tf_clock,
            software_clock: uses_software_clock.then(|| {
                let rate = SoftwareTfClock::rate_for_period(config.tf_period_orbits);
                info!("equipment {}: timeframe ids generated by software, {:.2} Hz", config.name, rate);
                SoftwareTfClock::new(rate)
            }),
            tf_regulator: RateRegulator::new(config.tf_rate_limit),
            throttled_block: None,
            started_at: Instant::now(),
            debug_pages_left: config.debug_first_pages,
            rdh_error_token: LogToken::new(30, Duration::from_secs(5)),
            tf_gap_token: LogToken::new(10, Duration::from_secs(60)),
            console_stats_at: None,
            config: config.clone(),
        };

        Ok(Self {
            name: config.name.clone(),
            stop_on_error: config.stop_on_error,
            pool,
            output,
            counters,
            data_on,
            worker: Arc::new(Mutex::new(worker)),
            thread: None,
            idle_sleep: config.idle_sleep,
            started_at: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_on_error(&self) -> bool {
        self.stop_on_error
    }

    /// The FIFO downstream stages pop published blocks from.
    pub fn output(&self) -> Arc<Fifo<DataBlockRef>> {
        self.output.clone()
    }

    pub fn counters(&self) -> Arc<EquipmentCounters> {
        self.counters.clone()
    }

    pub fn memory_usage(&self) -> (usize, usize) {
        (self.pool.available_pages(), self.pool.total_pages())
    }

    /// Starts the loop thread. Data production stays off until
    /// [`Equipment::set_data_on`].
    pub fn start(&mut self) -> Result<(), EquipmentError> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.counters.reset();
        self.started_at = Instant::now();
        {
            let mut w = self.worker.lock().expect("equipment worker mutex poisoned");
            w.current_block_id = 0;
            w.last_timeframe = UNDEFINED_TIMEFRAME_ID;
            w.push_stats.reset();
            w.throttled_block = None;
            w.started_at = self.started_at;
            w.tf_regulator.reset();
            w.console_stats_at = (w.config.console_stats_update_time > 0.0)
                .then(|| Instant::now() + Duration::from_secs_f64(w.config.console_stats_update_time));
            w.source.start()?;
        }
        let worker = self.worker.clone();
        self.thread = Some(LoopThread::start(&self.name, self.idle_sleep, move || {
            worker.lock().expect("equipment worker mutex poisoned").step()
        }));
        Ok(())
    }

    pub fn set_data_on(&self) {
        self.data_on.store(true, Ordering::Release);
    }

    pub fn set_data_off(&self) {
        self.data_on.store(false, Ordering::Release);
    }

    /// Stops the loop, reports totals and final pool statistics.
    pub fn stop(&mut self) {
        self.set_data_off();
        let running_time = self.started_at.elapsed().as_secs_f64();
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
        {
            let mut w = self.worker.lock().expect("equipment worker mutex poisoned");
            w.throttled_block = None;
            w.source.stop();
            if w.push_stats.count() > 0 {
                info!(
                    "{}: pages pushed per active iteration: avg={:.1} min={} max={}",
                    self.name,
                    w.push_stats.average(),
                    w.push_stats.minimum(),
                    w.push_stats.maximum(),
                );
            }
        }
        let c = &self.counters;
        info!(
            "{}: nBlocksOut={} nBytesOut={} nMemoryLow={} nOutputFull={} nIdle={} nLoop={} nThrottle={} nTimeframes={}",
            self.name,
            c.n_blocks_out.load(Ordering::Relaxed),
            c.n_bytes_out.load(Ordering::Relaxed),
            c.n_memory_low.load(Ordering::Relaxed),
            c.n_output_full.load(Ordering::Relaxed),
            c.n_idle.load(Ordering::Relaxed),
            c.n_loop.load(Ordering::Relaxed),
            c.n_throttle.load(Ordering::Relaxed),
            c.n_timeframes.load(Ordering::Relaxed),
        );
        if c.rdh_check_ok.load(Ordering::Relaxed) + c.rdh_check_err.load(Ordering::Relaxed) > 0 {
            info!(
                "{}: packet header checks: {} ok, {} errors, {} stream inconsistencies",
                self.name,
                c.rdh_check_ok.load(Ordering::Relaxed),
                c.rdh_check_err.load(Ordering::Relaxed),
                c.rdh_stream_err.load(Ordering::Relaxed),
            );
        }
        if running_time > 0.0 {
            info!(
                "{}: average data throughput: {}",
                self.name,
                format_bytes(c.n_bytes_out.load(Ordering::Relaxed) as f64 / running_time, "B/s")
            );
        }
        let links = c.links_used.load(Ordering::Relaxed);
        if links != 0 {
            let mut per_link = String::new();
            for id in 0..=RDH_MAX_LINK_ID {
                if links & (1 << id) != 0 {
                    per_link.push_str(&format!(
                        "[{}]={} ",
                        id,
                        format_bytes(c.link_bytes[id as usize].load(Ordering::Relaxed) as f64, "B")
                    ));
                }
            }
            info!("{}: links data received: {}", self.name, per_link.trim_end());
        }
        info!("{}: {}", self.name, self.pool.stats_string());
        self.pool.report_page_states();
    }

    /// True when the worker counted source or validation errors.
    pub fn is_error(&self) -> bool {
        self.counters.n_errors.load(Ordering::Relaxed) > 0
    }
}

/// Builds an equipment from its config section, choosing the source from
/// `equipmentType` (dummy | emulator | player).
pub fn create_equipment(
    cfg: &ConfigMap,
    section: &str,
    ctx: &PipelineContext,
) -> Result<Equipment, EquipmentError> {
    let kind = cfg
        .get_str(section, "equipmentType")
        .ok_or_else(|| ConfigError::Missing { section: section.into(), key: "equipmentType".into() })?;
    match kind {
        "dummy" => {
            let source = GeneratorSource::from_config(cfg, section)?;
            Equipment::new(cfg, section, ctx, Box::new(source), false)
        }
        "emulator" => {
            let source = EmulatorSource::from_config(cfg, section)?;
            Equipment::new(cfg, section, ctx, Box::new(source), true)
        }
        "player" => {
            let source = PlayerSource::from_config(cfg, section)?;
            Equipment::new(cfg, section, ctx, Box::new(source), false)
        }
        other => Err(EquipmentError::Config(ConfigError::BadValue {
            section: section.into(),
            key: "equipmentType".into(),
            value: other.into(),
            expected: "dummy | emulator | player",
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBank;

    fn test_ctx(bank_size: usize) -> PipelineContext {
        let ctx = PipelineContext::new();
        ctx.banks
            .add_bank(Arc::new(MemoryBank::new_malloc(bank_size, "test").unwrap()), "test");
        ctx
    }

    fn dummy_cfg(section: &str, extra: &[(&str, &str)]) -> ConfigMap {
        let mut cfg = ConfigMap::new();
        cfg.set(section, "equipmentType", "dummy");
        cfg.set(section, "id", "1");
        cfg.set(section, "memoryPoolPageSize", "8k");
        cfg.set(section, "memoryPoolNumberOfPages", "16");
        cfg.set(section, "blockAlign", "0");
        cfg.set(section, "eventMaxSize", "1k");
        cfg.set(section, "eventMinSize", "1k");
        for (k, v) in extra {
            cfg.set(section, k, v);
        }
        cfg
    }

    fn drain_blocks(eq: &Equipment, want: usize, timeout: Duration) -> Vec<DataBlockRef> {
        let out = eq.output();
        let t0 = Instant::now();
        let mut blocks = Vec::new();
        while blocks.len() < want && t0.elapsed() < timeout {
            match out.pop() {
                Some(b) => blocks.push(b),
                None => std::thread::sleep(Duration::from_micros(200)),
            }
        }
        blocks
    }

    #[test]
    fn produces_stamped_blocks() {
        let ctx = test_ctx(1024 * 1024);
        let cfg = dummy_cfg("equipment-dummy-1", &[]);
        let mut eq = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        eq.start().unwrap();
        eq.set_data_on();
        let blocks = drain_blocks(&eq, 5, Duration::from_secs(2));
        eq.stop();
        assert_eq!(blocks.len(), 5);
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.header().block_id, i as u64 + 1);
            assert_eq!(b.header().equipment_id, 1);
            assert_ne!(b.header().timeframe_id, UNDEFINED_TIMEFRAME_ID);
            assert_eq!(b.header().data_size, 1024);
        }
    }

    #[test]
    fn stalled_consumer_reports_output_full() {
        let ctx = test_ctx(1024 * 1024);
        let cfg = dummy_cfg("equipment-dummy-1", &[("outputFifoSize", "4")]);
        let mut eq = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        eq.start().unwrap();
        eq.set_data_on();
        // nobody pops: the FIFO fills, then the loop goes idle
        let t0 = Instant::now();
        while eq.counters().n_output_full.load(Ordering::Relaxed) == 0
            && t0.elapsed() < Duration::from_secs(2)
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        let full = eq.counters().n_output_full.load(Ordering::Relaxed);
        eq.stop();
        assert!(full > 0);
        assert_eq!(eq.output().len(), 4);
    }

    #[test]
    fn pool_exhaustion_is_idle_not_fatal() {
        let ctx = test_ctx(256 * 1024);
        let mut cfg = dummy_cfg("equipment-dummy-1", &[("outputFifoSize", "64")]);
        cfg.set("equipment-dummy-1", "memoryPoolNumberOfPages", "8");
        let mut eq = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        eq.start().unwrap();
        eq.set_data_on();
        // hold all produced blocks so the pool drains
        let blocks = drain_blocks(&eq, 8, Duration::from_secs(2));
        let t0 = Instant::now();
        while eq.counters().n_memory_low.load(Ordering::Relaxed) == 0
            && t0.elapsed() < Duration::from_secs(2)
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        let memory_low = eq.counters().n_memory_low.load(Ordering::Relaxed);
        eq.stop();
        drop(blocks);
        assert!(memory_low > 0);
        assert!(!eq.is_error());
    }

    #[test]
    fn block_rate_cap_is_respected() {
        let ctx = test_ctx(1024 * 1024);
        let mut cfg = dummy_cfg("equipment-dummy-1", &[]);
        cfg.set("readout", "rate", "200");
        let mut eq = create_equipment(&cfg, "equipment-dummy-1", &ctx).unwrap();
        eq.start().unwrap();
        eq.set_data_on();
        let run = Duration::from_millis(300);
        let t0 = Instant::now();
        let mut n = 0u64;
        while t0.elapsed() < run {
            if eq.output().pop().is_some() {
                n += 1;
            } else {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
        let elapsed = t0.elapsed().as_secs_f64();
        eq.stop();
        // admitted blocks <= R*T + 1 (plus one fifo's worth of slack for
        // blocks produced before we started draining)
        assert!((n as f64) <= 200.0 * elapsed + 2.0, "n = {}", n);
    }

    #[test]
    fn emulator_blocks_are_tagged_from_their_orbit() {
        use crate::tfclock::published_first_orbit;

        let ctx = test_ctx(1024 * 1024);
        let mut cfg = ConfigMap::new();
        cfg.set("equipment-emu-1", "equipmentType", "emulator");
        cfg.set("equipment-emu-1", "memoryPoolPageSize", "4k");
        cfg.set("equipment-emu-1", "memoryPoolNumberOfPages", "32");
        cfg.set("equipment-emu-1", "blockAlign", "0");
        cfg.set("equipment-emu-1", "cruBlockSize", "256");
        cfg.set("equipment-emu-1", "TFperiod", "8");
        cfg.set("equipment-emu-1", "orbitRate", "1000000");

        let mut eq = create_equipment(&cfg, "equipment-emu-1", &ctx).unwrap();
        eq.start().unwrap();
        eq.set_data_on();
        let blocks = drain_blocks(&eq, 10, Duration::from_secs(3));
        eq.stop();

        assert_eq!(blocks.len(), 10);
        let first_orbit = published_first_orbit(&ctx.stats.first_orbit).expect("first orbit published");
        for b in &blocks {
            let h = b.header();
            assert!(h.is_rdh_format);
            let rdh = crate::rdh::RdhView::parse(b.payload()).unwrap();
            let orbit = rdh.orbit();
            let expected_tf = 1 + (orbit - first_orbit) as u64 / 8;
            assert_eq!(h.timeframe_id, expected_tf);
            assert!(h.timeframe_orbit_first <= orbit && orbit <= h.timeframe_orbit_last);
        }
    }

    #[test]
    fn missing_pool_is_fatal_at_construction() {
        let ctx = PipelineContext::new(); // no banks registered
        let cfg = dummy_cfg("equipment-dummy-1", &[]);
        assert!(create_equipment(&cfg, "equipment-dummy-1", &ctx).is_err());
    }

    #[test]
    fn unknown_equipment_type_is_rejected() {
        let ctx = test_ctx(1024 * 1024);
        let mut cfg = dummy_cfg("equipment-x", &[]);
        cfg.set("equipment-x", "equipmentType", "teleport");
        assert!(create_equipment(&cfg, "equipment-x", &ctx).is_err());
    }
}
