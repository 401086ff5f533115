//! Registry of named memory banks, carving aligned sub-ranges for pools.
//!
//! Only touched at pool creation and teardown; never on the data path.

use super::bank::MemoryBank;
use super::pool::PagePool;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug)]
pub enum BankManagerError {
    /// No bank registered at all.
    NoBanks,
    /// The requested bank name is unknown.
    NoSuchBank(String),
    /// The bank has not enough free space left (missing bytes).
    OutOfSpace { bank: String, missing: usize },
    /// Page size or count of zero.
    BadParameters,
}

impl fmt::Display for BankManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankManagerError::NoBanks => write!(f, "no memory bank defined"),
            BankManagerError::NoSuchBank(name) => write!(f, "no such memory bank '{}'", name),
            BankManagerError::OutOfSpace { bank, missing } => {
                write!(f, "not enough space left in memory bank '{}' (need {} bytes more)", bank, missing)
            }
            BankManagerError::BadParameters => write!(f, "invalid pool parameters"),
        }
    }
}

impl std::error::Error for BankManagerError {}

/// Parameters for carving one page pool out of a bank.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    /// Size of each page, bytes.
    pub page_size: usize,
    /// Number of pages requested.
    pub page_count: usize,
    /// Bank to carve from; `None` uses the first registered bank.
    pub bank_name: Option<String>,
    /// Alignment of the carved block's base address (0 = none).
    pub block_align: usize,
    /// Offset of the first page inside the carved block.
    pub first_page_offset: usize,
    /// Pool identifier used in logs and page-state reports.
    pub pool_id: i32,
}

struct MemoryRange {
    offset: usize,
    size: usize,
}

struct BankEntry {
    name: String,
    bank: Arc<MemoryBank>,
    ranges_in_use: Vec<MemoryRange>,
}

/// Process-wide (but explicitly passed, never global) bank registry.
#[derive(Default)]
pub struct BankManager {
    banks: Mutex<Vec<BankEntry>>,
}

impl BankManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bank under a name; an empty name uses the bank's own
    /// description.
    pub fn add_bank(&self, bank: Arc<MemoryBank>, name: &str) {
        let name = if name.is_empty() { bank.description().to_string() } else { name.to_string() };
        info!("registered memory bank '{}' ({} bytes)", name, bank.size());
        self.banks.lock().expect("bank registry mutex poisoned").push(BankEntry {
            name,
            bank,
            ranges_in_use: Vec::new(),
        });
    }

    pub fn bank_names(&self) -> Vec<String> {
        self.banks
            .lock()
            .expect("bank registry mutex poisoned")
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    /// Carves an aligned sub-range from a bank and builds a page pool on
    /// it. One extra page beyond the requested count is reserved as
    /// alignment tolerance; if alignment eats into it, the pool may end
    /// up with fewer pages than requested, never more.
    pub fn create_pool(&self, spec: &PoolSpec) -> Result<Arc<PagePool>, BankManagerError> {
        if spec.page_size == 0 || spec.page_count == 0 {
            return Err(BankManagerError::BadParameters);
        }

        let mut banks = self.banks.lock().expect("bank registry mutex poisoned");
        if banks.is_empty() {
            return Err(BankManagerError::NoBanks);
        }
        let ix = match &spec.bank_name {
            Some(name) if !name.is_empty() => banks
                .iter()
                .position(|b| &b.name == name)
                .ok_or_else(|| BankManagerError::NoSuchBank(name.clone()))?,
            _ => {
                info!("bank name not specified, using first one ({})", banks[0].name);
                0
            }
        };
        let entry = &mut banks[ix];
        let base = entry.bank.base_address();

        // next free offset: after all ranges already handed out
        let mut offset = entry
            .ranges_in_use
            .iter()
            .map(|r| r.offset + r.size)
            .max()
            .unwrap_or(0);

        // the extra page is the alignment tolerance
        let mut block_size = spec.page_size * (spec.page_count + 1);

        if spec.block_align > 0 {
            let excess = (base as usize + offset) % spec.block_align;
            if excess != 0 {
                let shift = spec.block_align - excess;
                offset += shift;
                block_size = block_size.saturating_sub(shift);
            }
        }

        if offset + block_size > entry.bank.size() {
            let missing = offset + block_size - entry.bank.size();
            warn!("pool request does not fit in bank '{}': {} bytes missing", entry.name, missing);
            return Err(BankManagerError::OutOfSpace { bank: entry.name.clone(), missing });
        }

        entry.ranges_in_use.push(MemoryRange { offset, size: block_size });

        // SAFETY: the range [base+offset, base+offset+block_size) lies
        // within the bank and overlaps no previously carved range.
        let block_base = unsafe { base.add(offset) };
        let pool = PagePool::new(
            spec.page_size,
            spec.page_count,
            block_base,
            block_size,
            spec.first_page_offset,
            spec.pool_id,
            entry.bank.clone(),
        )
        .map_err(|_| BankManagerError::BadParameters)?;
        info!(
            "created pool {} from bank '{}': {} pages x {} bytes at offset {}",
            spec.pool_id,
            entry.name,
            pool.total_pages(),
            spec.page_size,
            offset
        );
        Ok(pool)
    }
}
