#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
pub mod platform;

mod buffer;
mod internal;
mod raw;
mod read;
mod state;
mod write;

extern crate alloc;

use embedded_storage::nor_flash::ReadNorFlash;

use crate::buffer::PageCache;
use crate::platform::Platform;
use crate::raw::{BUFFER_SIZE_MULTIPLIER, RESERVED_PAGES_MULTIPLIER, SECTORS_PER_PAGE};
use crate::state::{PageStateMap, PhysicalPageState};

pub use crate::error::Error;
pub use crate::raw::{PAGE_SIZE, SECTOR_SIZE};

/// Flash capacities the translation layer can manage, in MiB.
pub const SUPPORTED_FLASH_SIZES_MB: [u8; 6] = [4, 8, 16, 32, 64, 128];

/// Per-state physical page counts, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageStatistics {
    pub unknown: u32,
    pub used: u32,
    pub erase_required: u32,
    pub erased: u32,
}

/// The translation-layer handle. All mutable state for one flash device
/// lives here; independent devices are driven by independent `Ftl` values.
/// Dropping the handle releases RAM only; flash is left untouched, and
/// anything not yet [`sync`](Ftl::sync)ed is lost.
pub struct Ftl<T: Platform> {
    pub(crate) hal: T,
    pub(crate) physical_page_count: u16,
    pub(crate) tt_page_count: u16,
    pub(crate) usable_sector_count: u32,
    pub(crate) mtt_physical_page_no: i16,
    pub(crate) write_frontier: u16,
    pub(crate) page_state: PageStateMap,
    pub(crate) cache: PageCache,
}

impl<T: Platform> Ftl<T> {
    /// Brings up the translation layer on `hal`, a flash device of
    /// `flash_size_mb` MiB. Scans for an existing table set and mounts it;
    /// a medium without one is formatted from scratch.
    pub fn new(hal: T, flash_size_mb: u8) -> Result<Self, Error> {
        if !SUPPORTED_FLASH_SIZES_MB.contains(&flash_size_mb) {
            return Err(Error::UnsupportedFlashSize);
        }
        let flash_bytes = flash_size_mb as usize * 1024 * 1024;
        if hal.capacity() < flash_bytes {
            return Err(Error::UnsupportedFlashSize);
        }

        let physical_page_count = (flash_bytes / PAGE_SIZE) as u16;
        let tt_page_count = physical_page_count / raw::TT_RECORDS_PER_PAGE as u16;
        let usable_sector_count = (physical_page_count as u32
            - tt_page_count as u32 * RESERVED_PAGES_MULTIPLIER)
            * SECTORS_PER_PAGE;

        let mut ftl = Self {
            page_state: PageStateMap::new(physical_page_count),
            cache: PageCache::new((tt_page_count * BUFFER_SIZE_MULTIPLIER) as usize),
            hal,
            physical_page_count,
            tt_page_count,
            usable_sector_count,
            mtt_physical_page_no: 0,
            write_frontier: 0,
        };
        if !ftl.mount()? {
            ftl.format()?;
        }
        Ok(ftl)
    }

    /// Number of sectors the layer exposes. Physical pages beyond this are
    /// the relocation reserve that keeps erase churn bounded near full.
    pub fn usable_sectors(&self) -> u32 {
        self.usable_sector_count
    }

    pub fn statistics(&self) -> PageStatistics {
        let mut stats = PageStatistics {
            unknown: 0,
            used: 0,
            erase_required: 0,
            erased: 0,
        };
        for page_no in 0..self.page_state.page_count() {
            match self.page_state.get(page_no) {
                PhysicalPageState::Unknown => stats.unknown += 1,
                PhysicalPageState::Used => stats.used += 1,
                PhysicalPageState::EraseRequired => stats.erase_required += 1,
                PhysicalPageState::Erased => stats.erased += 1,
            }
        }
        stats
    }
}
