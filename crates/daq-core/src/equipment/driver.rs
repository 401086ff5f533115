//! Narrow interface to page-filling drivers (DMA engines and their
//! emulations): the equipment hands free pages in, and polls filled
//! pages out. [`DriverSource`] adapts any such channel to the
//! [`DataSource`] contract.

use super::{DataSource, EquipmentError};
use crate::block::DataBlock;
use crate::memory::{FreePage, PagePool, PageState};
use crate::thread::LoopStatus;
use std::sync::Arc;

/// A device-like channel that fills pages asynchronously.
pub trait DriverChannel: Send + 'static {
    fn start(&mut self) -> Result<(), EquipmentError> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Hands an empty page to the driver; gives the page back when the
    /// driver queue is full.
    fn push_free_page(&mut self, page: FreePage) -> Result<(), FreePage>;

    /// Next filled page with the number of bytes written, if any.
    fn poll_ready(&mut self) -> Option<(FreePage, usize)>;

    /// Packets the driver had to drop for lack of free pages.
    fn dropped_packets(&self) -> u64 {
        0
    }
}

/// Adapter running a [`DriverChannel`] behind an equipment: `prepare`
/// keeps the driver supplied with free pages, `next_block` drains the
/// ready queue.
pub struct DriverSource {
    channel: Box<dyn DriverChannel>,
    /// Pages currently inside the driver.
    in_driver: usize,
    /// Upper bound of pages parked in the driver at any time.
    max_in_driver: usize,
}

impl DriverSource {
    pub fn new(channel: Box<dyn DriverChannel>, max_in_driver: usize) -> Self {
        Self {
            channel,
            in_driver: 0,
            max_in_driver: max_in_driver.max(1),
        }
    }

    pub fn dropped_packets(&self) -> u64 {
        self.channel.dropped_packets()
    }
}

impl DataSource for DriverSource {
    fn start(&mut self) -> Result<(), EquipmentError> {
        self.in_driver = 0;
        self.channel.start()
    }

    fn stop(&mut self) {
        self.channel.stop();
    }

    fn prepare(&mut self, pool: &Arc<PagePool>) -> LoopStatus {
        let mut pushed = false;
        while self.in_driver < self.max_in_driver {
            let Some(page) = pool.new_page() else { break };
            pool.update_page_state(page.address(), PageState::InDriver);
            match self.channel.push_free_page(page) {
                Ok(()) => {
                    self.in_driver += 1;
                    pushed = true;
                }
                Err(page) => {
                    // driver queue full; take the page back
                    pool.release_page(page.address());
                    break;
                }
            }
        }
        if pushed { LoopStatus::Ok } else { LoopStatus::Idle }
    }

    fn next_block(&mut self, pool: &Arc<PagePool>) -> Result<Option<DataBlock>, EquipmentError> {
        let Some((page, bytes_written)) = self.channel.poll_ready() else {
            return Ok(None);
        };
        self.in_driver = self.in_driver.saturating_sub(1);
        let mut block = pool
            .new_data_block(Some(page))
            .ok_or_else(|| EquipmentError::Source("driver returned a page the pool rejects".into()))?;
        block.set_data_size(bytes_written);
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BankManager, MemoryBank, PoolSpec};
    use std::collections::VecDeque;

    /// Fills each page with its sequence number after a fixed delay of
    /// one poll call.
    struct LoopbackChannel {
        queue: VecDeque<FreePage>,
        capacity: usize,
        sequence: u8,
    }

    impl DriverChannel for LoopbackChannel {
        fn push_free_page(&mut self, page: FreePage) -> Result<(), FreePage> {
            if self.queue.len() >= self.capacity {
                return Err(page);
            }
            self.queue.push_back(page);
            Ok(())
        }

        fn poll_ready(&mut self) -> Option<(FreePage, usize)> {
            let mut page = self.queue.pop_front()?;
            self.sequence = self.sequence.wrapping_add(1);
            let filled = 128usize.min(page.size());
            page.as_mut_slice()[..filled].fill(self.sequence);
            Some((page, filled))
        }
    }

    fn pool() -> Arc<PagePool> {
        let mgr = BankManager::new();
        mgr.add_bank(Arc::new(MemoryBank::new_malloc(64 * 1024, "drv").unwrap()), "drv");
        mgr.create_pool(&PoolSpec {
            page_size: 1024,
            page_count: 8,
            bank_name: None,
            block_align: 0,
            first_page_offset: 0,
            pool_id: 0,
        })
        .unwrap()
    }

    #[test]
    fn pages_cycle_through_the_driver() {
        let pool = pool();
        let channel = LoopbackChannel { queue: VecDeque::new(), capacity: 4, sequence: 0 };
        let mut src = DriverSource::new(Box::new(channel), 4);
        src.start().unwrap();

        assert_eq!(src.prepare(&pool), LoopStatus::Ok);
        assert_eq!(pool.available_pages(), 4);

        let block = src.next_block(&pool).unwrap().unwrap();
        assert_eq!(block.header().data_size, 128);
        assert!(block.payload().iter().all(|&b| b == 1));
        drop(block);
        assert_eq!(pool.available_pages(), 5);
    }

    #[test]
    fn driver_backpressure_returns_pages() {
        let pool = pool();
        let channel = LoopbackChannel { queue: VecDeque::new(), capacity: 2, sequence: 0 };
        // the source would park up to 6 pages, the channel takes 2
        let mut src = DriverSource::new(Box::new(channel), 6);
        src.start().unwrap();
        src.prepare(&pool);
        assert_eq!(pool.available_pages(), 6);
    }

    #[test]
    fn empty_driver_is_idle() {
        let pool = pool();
        let channel = LoopbackChannel { queue: VecDeque::new(), capacity: 0, sequence: 0 };
        let mut src = DriverSource::new(Box::new(channel), 2);
        src.start().unwrap();
        assert_eq!(src.prepare(&pool), LoopStatus::Idle);
        assert!(src.next_block(&pool).unwrap().is_none());
    }
}
