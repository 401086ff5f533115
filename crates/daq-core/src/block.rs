//! Data blocks: the unit of readout moving through the pipeline.
//!
//! A [`DataBlock`] owns one pool page and carries the block header
//! describing its origin. Blocks are mutable while uniquely owned (inside
//! the producing equipment); once published to an output FIFO they are
//! shared as [`DataBlockRef`] and read-only, except for the
//! end-of-timeframe flag which the timeframe builder sets late through an
//! atomic. Dropping the last reference returns the page to its pool.

use crate::memory::{PagePool, PageState};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Value used when a block id is not assigned.
pub const UNDEFINED_BLOCK_ID: u64 = 0;
/// Value used when a timeframe id is not assigned.
pub const UNDEFINED_TIMEFRAME_ID: u64 = 0;
/// Value used when a system id is not assigned.
pub const UNDEFINED_SYSTEM_ID: u8 = 0xFF;
/// Value used when a FEE id is not assigned.
pub const UNDEFINED_FEE_ID: u16 = 0xFFFF;
/// Value used when an equipment id is not assigned.
pub const UNDEFINED_EQUIPMENT_ID: u16 = 0xFFFF;
/// Value used when a link id is not assigned.
pub const UNDEFINED_LINK_ID: u8 = 0xFF;
/// Value used when an orbit counter is not assigned.
pub const UNDEFINED_ORBIT: u32 = 0;

/// Header common to all data blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload size in bytes (may be less than the page size).
    pub data_size: u32,
    /// Strictly monotonic per-equipment sequence number, starting at 1.
    pub block_id: u64,
    /// Id used to sort data in/out of parallel pipelines.
    pub pipeline_id: u64,
    /// Timeframe this block belongs to.
    pub timeframe_id: u64,
    /// Detector system id, from the packet header.
    pub system_id: u8,
    /// Front-end electronics id, from the packet header.
    pub fee_id: u16,
    /// Id of the equipment that produced the block.
    pub equipment_id: u16,
    /// Link id, from the packet header.
    pub link_id: u8,
    /// First orbit of the enclosing timeframe.
    pub timeframe_orbit_first: u32,
    /// Last orbit of the enclosing timeframe.
    pub timeframe_orbit_last: u32,
    /// Set when the payload is formatted as packet-header framed data.
    pub is_rdh_format: bool,
    /// Run number the block was taken in.
    pub run_number: u32,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            data_size: 0,
            block_id: UNDEFINED_BLOCK_ID,
            pipeline_id: UNDEFINED_BLOCK_ID,
            timeframe_id: UNDEFINED_TIMEFRAME_ID,
            system_id: UNDEFINED_SYSTEM_ID,
            fee_id: UNDEFINED_FEE_ID,
            equipment_id: UNDEFINED_EQUIPMENT_ID,
            link_id: UNDEFINED_LINK_ID,
            timeframe_orbit_first: UNDEFINED_ORBIT,
            timeframe_orbit_last: UNDEFINED_ORBIT,
            is_rdh_format: false,
            run_number: 0,
        }
    }
}

/// One block of readout data, backed by a pool page.
pub struct DataBlock {
    header: BlockHeader,
    end_of_timeframe: AtomicBool,
    payload: NonNull<u8>,
    capacity: usize,
    pool: Weak<PagePool>,
    page_index: usize,
}

// The payload page belongs to this block exclusively (it is out of the
// pool free list); mutation requires &mut, shared access is read-only.
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

impl DataBlock {
    /// Called by the pool when wrapping a free page. The header starts
    /// with defaults and a full-page payload size.
    pub(crate) fn from_pool_page(
        pool: &Arc<PagePool>,
        payload: NonNull<u8>,
        capacity: usize,
        page_index: usize,
    ) -> Self {
        Self {
            header: BlockHeader {
                data_size: capacity as u32,
                ..BlockHeader::default()
            },
            end_of_timeframe: AtomicBool::new(false),
            payload,
            capacity,
            pool: Arc::downgrade(pool),
            page_index,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    /// Payload bytes actually used (`header.data_size`).
    pub fn payload(&self) -> &[u8] {
        let len = (self.header.data_size as usize).min(self.capacity);
        // SAFETY: the page is exclusively owned by this block; shared
        // references only read.
        unsafe { std::slice::from_raw_parts(self.payload.as_ptr(), len) }
    }

    /// Full writable page; callers set `header.data_size` afterwards.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.payload.as_ptr(), self.capacity) }
    }

    /// Usable page capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinks the payload to `size` bytes (clamped to capacity).
    pub fn set_data_size(&mut self, size: usize) {
        self.header.data_size = size.min(self.capacity) as u32;
    }

    pub fn page_address(&self) -> *const u8 {
        self.payload.as_ptr()
    }

    pub fn end_of_timeframe(&self) -> bool {
        self.end_of_timeframe.load(Ordering::Acquire)
    }

    /// Marks this block as the last of its timeframe. Called by the
    /// timeframe builder after the block is already shared.
    pub fn set_end_of_timeframe(&self) {
        self.end_of_timeframe.store(true, Ordering::Release);
    }

    /// Records where in the pipeline this block's page currently sits.
    pub fn set_page_state(&self, state: PageState) {
        if let Some(pool) = self.pool.upgrade() {
            pool.set_page_state(self.page_index, state);
        }
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        crate::memory::pool_release_to_weak(&self.pool, self.page_index);
    }
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("block_id", &self.header.block_id)
            .field("equipment_id", &self.header.equipment_id)
            .field("link_id", &self.header.link_id)
            .field("timeframe_id", &self.header.timeframe_id)
            .field("data_size", &self.header.data_size)
            .field("end_of_timeframe", &self.end_of_timeframe())
            .finish()
    }
}

/// Shared handle to a published block.
pub type DataBlockRef = Arc<DataBlock>;

/// Ordered blocks of one slice (single source, single timeframe).
pub type DataSet = Vec<DataBlockRef>;
