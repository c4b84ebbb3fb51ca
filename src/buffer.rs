//! Write-back page cache: a bounded set of in-RAM page slots with
//! least-recently-used replacement. Slots holding uncommitted changes are
//! locked in place until sync programs them; everything addresses slots by
//! stable index, so nothing moves while a caller is working on one.

use alloc::vec::Vec;
use embedded_storage::nor_flash::ReadNorFlash;

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::PAGE_SIZE;

/// How a locked buffer reaches flash at the next sync.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ProgramMode {
    /// No pending program.
    None,
    /// Every changed bit goes 1 -> 0; the page programs in place.
    Program,
    /// Freshly allocated page; erase first unless it is known blank.
    EraseProgram,
    /// The change needs a bit raised, so the contents move to a newly
    /// allocated page and the old one is orphaned.
    RelocateEraseProgram,
}

/// One cached page. The page numbers are -1 while the slot is empty.
pub(crate) struct PageBuffer {
    pub(crate) logical_page_no: i16,
    pub(crate) physical_page_no: i16,
    pub(crate) lock: bool,
    pub(crate) p_mode: ProgramMode,
    pub(crate) page: [u8; PAGE_SIZE],
}

impl PageBuffer {
    fn empty() -> Self {
        Self {
            logical_page_no: -1,
            physical_page_no: -1,
            lock: false,
            p_mode: ProgramMode::None,
            page: [0xFF; PAGE_SIZE],
        }
    }
}

/// The slot set plus a recency list of slot indices, hottest first.
pub(crate) struct PageCache {
    pub(crate) slots: Vec<PageBuffer>,
    order: Vec<u16>,
}

impl PageCache {
    pub(crate) fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, PageBuffer::empty);
        Self {
            slots,
            order: (0..size as u16).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn touch(&mut self, slot_idx: usize) {
        if let Some(pos) = self.order.iter().position(|&s| s as usize == slot_idx)
            && pos > 0
        {
            let slot = self.order.remove(pos);
            self.order.insert(0, slot);
        }
    }

    /// Coldest slot not pinned by an uncommitted change.
    fn victim(&self) -> Result<usize, Error> {
        self.order
            .iter()
            .rev()
            .map(|&s| s as usize)
            .find(|&s| !self.slots[s].lock)
            .ok_or(Error::NoFreeBuffers)
    }

    /// Looks a physical page up in the cache, promoting it on a hit.
    pub(crate) fn find(&mut self, physical_page_no: i16) -> Option<usize> {
        if physical_page_no < 0 {
            return None;
        }
        let idx = self
            .slots
            .iter()
            .position(|slot| slot.physical_page_no == physical_page_no)?;
        self.touch(idx);
        Some(idx)
    }

    /// Returns the slot holding `physical_page_no`, reading the page from
    /// flash into the coldest unlocked slot on a miss.
    pub(crate) fn load<T: Platform>(
        &mut self,
        hal: &mut T,
        logical_page_no: i16,
        physical_page_no: i16,
    ) -> Result<usize, Error> {
        if let Some(idx) = self.find(physical_page_no) {
            return Ok(idx);
        }
        let idx = self.victim()?;
        let slot = &mut self.slots[idx];
        // A failed read must not leave the slot claiming its old identity.
        slot.physical_page_no = -1;
        hal.read(physical_page_no as u32 * PAGE_SIZE as u32, &mut slot.page)
            .map_err(|_| Error::FlashError)?;
        slot.logical_page_no = logical_page_no;
        slot.physical_page_no = physical_page_no;
        slot.lock = false;
        slot.p_mode = ProgramMode::None;
        self.touch(idx);
        Ok(idx)
    }

    /// Claims a slot for a page with no on-flash contents yet: blank
    /// payload, locked, armed for erase-and-program.
    pub(crate) fn init(
        &mut self,
        logical_page_no: i16,
        physical_page_no: i16,
    ) -> Result<usize, Error> {
        let idx = match self.find(physical_page_no) {
            Some(idx) => idx,
            None => {
                let idx = self.victim()?;
                self.touch(idx);
                idx
            }
        };
        let slot = &mut self.slots[idx];
        slot.logical_page_no = logical_page_no;
        slot.physical_page_no = physical_page_no;
        slot.lock = true;
        slot.p_mode = ProgramMode::EraseProgram;
        slot.page.fill(0xFF);
        Ok(idx)
    }

    /// True when at least `count` slots are free to take new pages.
    pub(crate) fn has_free(&self, count: usize) -> bool {
        self.slots.iter().filter(|slot| !slot.lock).count() >= count
    }
}
