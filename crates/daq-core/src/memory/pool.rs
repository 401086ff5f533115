//! Fixed-size page pool over a bank sub-range.
//!
//! Optimized for one getter thread and one releaser thread: the free list
//! is a lock-free ring, and all bookkeeping is atomic. A page address is
//! valid iff it lies between the first and last page and is a multiple of
//! the page size away from the first.

use super::bank::MemoryBank;
use crate::block::DataBlock;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tracing::info;

/// Lifecycle position of a page. Each page records cumulative time spent
/// in each state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Waiting in the pool free list.
    Idle = 0,
    /// Handed out by `new_page` / `new_data_block`.
    Allocated = 1,
    /// Given to a driver/source to be filled.
    InDriver = 2,
    /// Being processed by the equipment loop.
    InEquipment = 3,
    /// Parked in the equipment output FIFO.
    InEquipmentFifoOut = 4,
    /// Pending slicing / timeframe building.
    InAggregator = 5,
    /// Parked in the aggregator output FIFO.
    InAggregatorFifoOut = 6,
    /// Being processed by a sink.
    InConsumer = 7,
    /// Handed to an external transport.
    InTransport = 8,
    /// Not tracked.
    Undefined = 9,
}

/// Number of page states, including `Undefined`.
pub const PAGE_STATE_COUNT: usize = 10;

impl PageState {
    pub fn as_str(self) -> &'static str {
        match self {
            PageState::Idle => "idle",
            PageState::Allocated => "allocated",
            PageState::InDriver => "inDriver",
            PageState::InEquipment => "inEquipment",
            PageState::InEquipmentFifoOut => "inEquipmentFifoOut",
            PageState::InAggregator => "inAggregator",
            PageState::InAggregatorFifoOut => "inAggregatorFifoOut",
            PageState::InConsumer => "inConsumer",
            PageState::InTransport => "inTransport",
            PageState::Undefined => "undefined",
        }
    }

    fn from_u8(v: u8) -> PageState {
        match v {
            0 => PageState::Idle,
            1 => PageState::Allocated,
            2 => PageState::InDriver,
            3 => PageState::InEquipment,
            4 => PageState::InEquipmentFifoOut,
            5 => PageState::InAggregator,
            6 => PageState::InAggregatorFifoOut,
            7 => PageState::InConsumer,
            8 => PageState::InTransport,
            _ => PageState::Undefined,
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    /// Page size/count/offset not compatible with the given block.
    BadParameters,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::BadParameters => write!(f, "invalid page pool parameters"),
        }
    }
}

impl std::error::Error for PoolError {}

/// A free page handed to a data source to be filled.
///
/// Raw handle: the holder has exclusive access to the page bytes until it
/// either builds a data block from it or releases it back.
#[derive(Debug)]
pub struct FreePage {
    ptr: NonNull<u8>,
    size: usize,
    index: usize,
}

// Exclusive logical ownership of the page while the handle exists.
unsafe impl Send for FreePage {}

impl FreePage {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the pool guarantees this page is out of the free list
        // and referenced by this handle only.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub fn address(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

struct PageMeta {
    state: AtomicU8,
    /// Time of the last state transition, microseconds since pool epoch.
    state_since_us: AtomicU64,
    /// Cumulative time per state, microseconds. Approximate under
    /// concurrency; diagnostics only.
    time_in_state_us: [AtomicU64; PAGE_STATE_COUNT],
    times_used: AtomicU64,
}

impl PageMeta {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PageState::Idle as u8),
            state_since_us: AtomicU64::new(0),
            time_in_state_us: Default::default(),
            times_used: AtomicU64::new(0),
        }
    }
}

struct WarnConfig {
    callback: Box<dyn Fn(&str) + Send + Sync>,
    threshold_high: f64,
    threshold_ok: f64,
}

const BUFFER_STATE_NORMAL: u8 = 0;
const BUFFER_STATE_HIGH: u8 = 1;

/// Pool of equal-size pages with a lock-free free list.
pub struct PagePool {
    page_size: usize,
    page_count: usize,
    first_page: NonNull<u8>,
    last_page: NonNull<u8>,
    pool_id: i32,
    free: ArrayQueue<usize>,
    meta: Vec<PageMeta>,
    epoch: Instant,
    warn: OnceLock<WarnConfig>,
    buffer_state: AtomicU8,
    usage_gauge: OnceLock<Arc<AtomicU64>>,
    // keeps the backing bank mapped for as long as any pool (and through
    // the weak upgrade in DataBlock::drop, any page) is alive
    _bank: Arc<MemoryBank>,
}

unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Builds a pool over `[base, base+block_size)`. The page count is
    /// reduced if the block cannot fit `page_count` pages after
    /// `first_page_offset`.
    pub(crate) fn new(
        page_size: usize,
        page_count: usize,
        base: *mut u8,
        block_size: usize,
        first_page_offset: usize,
        pool_id: i32,
        bank: Arc<MemoryBank>,
    ) -> Result<Arc<Self>, PoolError> {
        if page_size == 0 || page_count == 0 || block_size == 0 || first_page_offset >= block_size {
            return Err(PoolError::BadParameters);
        }
        let mut count = page_count;
        if page_size * count + first_page_offset > block_size {
            count = (block_size - first_page_offset) / page_size;
        }
        if count == 0 {
            return Err(PoolError::BadParameters);
        }

        let free = ArrayQueue::new(count);
        for i in 0..count {
            free.push(i).expect("free list sized for all pages");
        }
        // SAFETY: offset stays within the block, checked above.
        let first_page = unsafe { NonNull::new_unchecked(base.add(first_page_offset)) };
        let last_page = unsafe { NonNull::new_unchecked(first_page.as_ptr().add((count - 1) * page_size)) };

        Ok(Arc::new(Self {
            page_size,
            page_count: count,
            first_page,
            last_page,
            pool_id,
            free,
            meta: (0..count).map(|_| PageMeta::new()).collect(),
            epoch: Instant::now(),
            warn: OnceLock::new(),
            buffer_state: AtomicU8::new(BUFFER_STATE_NORMAL),
            usage_gauge: OnceLock::new(),
            _bank: bank,
        }))
    }

    pub fn id(&self) -> i32 {
        self.pool_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Usable payload bytes per block; the whole page, since the block
    /// header travels out-of-band.
    pub fn block_max_size(&self) -> usize {
        self.page_size
    }

    pub fn total_pages(&self) -> usize {
        self.page_count
    }

    pub fn available_pages(&self) -> usize {
        self.free.len()
    }

    pub fn first_page_address(&self) -> *mut u8 {
        self.first_page.as_ptr()
    }

    /// Validity predicate: in range and stride-aligned.
    pub fn is_page_valid(&self, addr: *const u8) -> bool {
        let a = addr as usize;
        let first = self.first_page.as_ptr() as usize;
        let last = self.last_page.as_ptr() as usize;
        a >= first && a <= last && (a - first) % self.page_size == 0
    }

    /// Pops a page from the free list; `None` when exhausted.
    pub fn new_page(&self) -> Option<FreePage> {
        let index = self.free.pop()?;
        self.meta[index].times_used.fetch_add(1, Ordering::Relaxed);
        self.set_page_state(index, PageState::Allocated);
        self.update_buffer_state();
        // SAFETY: index < page_count, so the page lies inside the block.
        let ptr = unsafe { NonNull::new_unchecked(self.first_page.as_ptr().add(index * self.page_size)) };
        Some(FreePage { ptr, size: self.page_size, index })
    }

    /// Returns a page to the pool by address.
    ///
    /// Panics on an address that is not a page of this pool: that is a
    /// corruption bug, not a runtime condition.
    pub fn release_page(&self, addr: *const u8) {
        assert!(
            self.is_page_valid(addr),
            "releasing invalid page address {:p} (pool {})",
            addr,
            self.pool_id
        );
        let index = (addr as usize - self.first_page.as_ptr() as usize) / self.page_size;
        self.release_index(index);
    }

    /// Returns a page by pool index; used by the data block drop path.
    pub(crate) fn release_index(&self, index: usize) {
        assert!(index < self.page_count, "releasing invalid page index {}", index);
        self.set_page_state(index, PageState::Idle);
        self.free
            .push(index)
            .expect("free list can always re-absorb a page it handed out");
        self.update_buffer_state();
    }

    /// Wraps a page (fresh from the free list if `page` is `None`) into a
    /// data block with a default header and full-page payload capacity.
    pub fn new_data_block(self: &Arc<Self>, page: Option<FreePage>) -> Option<DataBlock> {
        let page = match page {
            Some(p) => {
                assert!(
                    self.is_page_valid(p.address()),
                    "foreign page address {:p} given to pool {}",
                    p.address(),
                    self.pool_id
                );
                p
            }
            None => self.new_page()?,
        };
        Some(DataBlock::from_pool_page(self, page.ptr, page.size, page.index))
    }

    /// Records a state transition for the page holding `index`.
    pub(crate) fn set_page_state(&self, index: usize, state: PageState) {
        let meta = &self.meta[index];
        let now_us = self.epoch.elapsed().as_micros() as u64;
        let prev = meta.state.swap(state as u8, Ordering::Relaxed);
        let since = meta.state_since_us.swap(now_us, Ordering::Relaxed);
        let spent = now_us.saturating_sub(since);
        meta.time_in_state_us[prev as usize].fetch_add(spent, Ordering::Relaxed);
    }

    /// Records a state transition by page address; ignores foreign
    /// addresses (the caller may hold blocks from several pools).
    pub fn update_page_state(&self, addr: *const u8, state: PageState) {
        if !self.is_page_valid(addr) {
            return;
        }
        let index = (addr as usize - self.first_page.as_ptr() as usize) / self.page_size;
        self.set_page_state(index, state);
    }

    /// Installs the low-memory warning hook with hysteresis thresholds:
    /// crossing `threshold_high` upward warns once, dropping below
    /// `threshold_ok` afterwards reports recovery.
    pub fn set_warning_callback<F>(&self, callback: F, threshold_high: f64, threshold_ok: f64)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let _ = self.warn.set(WarnConfig {
            callback: Box::new(callback),
            threshold_high,
            threshold_ok,
        });
    }

    /// Installs a shared gauge updated with the usage ratio (f64 bits) on
    /// every page movement.
    pub fn set_usage_gauge(&self, gauge: Arc<AtomicU64>) {
        let _ = self.usage_gauge.set(gauge);
    }

    /// Fraction of pages currently out of the free list (0.0 .. 1.0).
    pub fn usage_ratio(&self) -> f64 {
        1.0 - self.free.len() as f64 / self.page_count as f64
    }

    fn update_buffer_state(&self) {
        let usage = self.usage_ratio();
        if let Some(gauge) = self.usage_gauge.get() {
            gauge.store(usage.to_bits(), Ordering::Relaxed);
        }
        let Some(warn) = self.warn.get() else { return };
        match self.buffer_state.load(Ordering::Relaxed) {
            BUFFER_STATE_NORMAL if usage >= warn.threshold_high => {
                if self
                    .buffer_state
                    .compare_exchange(BUFFER_STATE_NORMAL, BUFFER_STATE_HIGH, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    (warn.callback)(&format!(
                        "pool {}: buffer usage high: {:.0}% of {} pages used",
                        self.pool_id,
                        usage * 100.0,
                        self.page_count
                    ));
                }
            }
            BUFFER_STATE_HIGH if usage <= warn.threshold_ok => {
                if self
                    .buffer_state
                    .compare_exchange(BUFFER_STATE_HIGH, BUFFER_STATE_NORMAL, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    (warn.callback)(&format!(
                        "pool {}: buffer usage back to normal ({:.0}%)",
                        self.pool_id,
                        usage * 100.0
                    ));
                }
            }
            _ => {}
        }
    }

    /// One-line usage summary for logs.
    pub fn stats_string(&self) -> String {
        format!(
            "pool {}: {}/{} pages free, page size {}",
            self.pool_id,
            self.free.len(),
            self.page_count,
            self.page_size
        )
    }

    /// Per-state page counts, for the detailed report.
    pub fn page_state_counts(&self) -> [usize; PAGE_STATE_COUNT] {
        let mut counts = [0usize; PAGE_STATE_COUNT];
        for meta in &self.meta {
            counts[meta.state.load(Ordering::Relaxed) as usize] += 1;
        }
        counts
    }

    /// Logs cumulative per-state residency, for end-of-run diagnostics.
    pub fn report_page_states(&self) {
        let mut totals = [0u64; PAGE_STATE_COUNT];
        for meta in &self.meta {
            for (i, t) in meta.time_in_state_us.iter().enumerate() {
                totals[i] += t.load(Ordering::Relaxed);
            }
        }
        let mut parts = Vec::new();
        for i in 0..PAGE_STATE_COUNT {
            if totals[i] > 0 {
                parts.push(format!("{}={:.3}s", PageState::from_u8(i as u8).as_str(), totals[i] as f64 / 1e6));
            }
        }
        info!("pool {} page-state residency: {}", self.pool_id, parts.join(" "));
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if self.free.len() != self.page_count {
            info!(
                "pool {} dropped with {} pages still in flight",
                self.pool_id,
                self.page_count - self.free.len()
            );
        }
    }
}

/// Upgrades a weak pool handle just long enough to give a page back.
/// When the pool is already gone (shutdown race) the page leaks with the
/// bank; this is deliberate and logged.
pub(crate) fn release_to_weak_pool(pool: &Weak<PagePool>, index: usize) {
    match pool.upgrade() {
        Some(pool) => pool.release_index(index),
        None => tracing::debug!("page {} released after its pool was dropped; leaking", index),
    }
}
