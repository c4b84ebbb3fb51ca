//! Volatile per-physical-page state, packed two bits per page.

use alloc::vec;
use alloc::vec::Vec;
use strum::FromRepr;

use crate::error::Error;
use crate::platform::{ErasedCheck, Platform};
use crate::raw::PAGE_SIZE;

/// What is known about one physical page since mount.
#[derive(FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum PhysicalPageState {
    /// Not probed since mount.
    Unknown = 0,
    /// Referenced by a live mapping, or holds a current translation table.
    Used = 1,
    /// Orphaned by a relocation; must be erased before reuse.
    EraseRequired = 2,
    /// Known blank, ready for programming.
    Erased = 3,
}

/// Dense map of [`PhysicalPageState`], sixteen entries per `u32` word.
/// All entries start out unknown; probing happens incrementally through
/// [`PageStateMap::resolve_unknown`] rather than in one mount-time sweep.
pub(crate) struct PageStateMap {
    words: Vec<u32>,
    page_count: u16,
    resolved: bool,
}

impl PageStateMap {
    pub(crate) fn new(page_count: u16) -> Self {
        Self {
            words: vec![0; page_count.div_ceil(16) as usize],
            page_count,
            resolved: false,
        }
    }

    pub(crate) fn get(&self, page_no: u16) -> PhysicalPageState {
        let bits = (self.words[(page_no >> 4) as usize] >> ((page_no & 0xF) * 2)) & 0x3;
        PhysicalPageState::from_repr(bits as u8).unwrap_or(PhysicalPageState::Unknown)
    }

    pub(crate) fn set(&mut self, page_no: u16, state: PhysicalPageState) {
        let word = &mut self.words[(page_no >> 4) as usize];
        let shift = (page_no & 0xF) * 2;
        *word &= !(0x3 << shift);
        *word |= (state as u32) << shift;
    }

    /// Classifies up to `count` pages still in the unknown state via the
    /// host's blank check, walking from `start` and wrapping at the end of
    /// the device. Probing everything at mount is too slow on large flash,
    /// so resolution is paid for in slices that stay ahead of the
    /// allocator. Once a full pass finds nothing left, the map is final and
    /// further calls return immediately.
    pub(crate) fn resolve_unknown<T: Platform>(
        &mut self,
        hal: &mut T,
        start: u16,
        count: u16,
    ) -> Result<(), Error> {
        if self.resolved || count == 0 {
            return Ok(());
        }
        let mut remaining = count;
        let mut page_no = start;
        for _ in 0..self.page_count {
            if self.get(page_no) == PhysicalPageState::Unknown {
                let erased = hal
                    .is_erased(page_no as u32 * PAGE_SIZE as u32)
                    .map_err(|_| Error::FlashError)?;
                self.set(
                    page_no,
                    if erased {
                        PhysicalPageState::Erased
                    } else {
                        PhysicalPageState::EraseRequired
                    },
                );
                remaining -= 1;
                if remaining == 0 {
                    return Ok(());
                }
            }
            page_no += 1;
            if page_no >= self.page_count {
                page_no = 0;
            }
        }
        self.resolved = true;
        Ok(())
    }

    pub(crate) fn page_count(&self) -> u16 {
        self.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_start_unknown() {
        let map = PageStateMap::new(40);
        for page_no in 0..40 {
            assert_eq!(map.get(page_no), PhysicalPageState::Unknown);
        }
    }

    #[test]
    fn set_is_isolated_per_entry() {
        let mut map = PageStateMap::new(64);
        map.set(15, PhysicalPageState::Used);
        map.set(16, PhysicalPageState::Erased);
        map.set(17, PhysicalPageState::EraseRequired);
        assert_eq!(map.get(14), PhysicalPageState::Unknown);
        assert_eq!(map.get(15), PhysicalPageState::Used);
        assert_eq!(map.get(16), PhysicalPageState::Erased);
        assert_eq!(map.get(17), PhysicalPageState::EraseRequired);
        assert_eq!(map.get(18), PhysicalPageState::Unknown);
    }

    #[test]
    fn states_overwrite_in_place() {
        let mut map = PageStateMap::new(16);
        map.set(3, PhysicalPageState::Erased);
        map.set(3, PhysicalPageState::Used);
        assert_eq!(map.get(3), PhysicalPageState::Used);
        map.set(3, PhysicalPageState::EraseRequired);
        assert_eq!(map.get(3), PhysicalPageState::EraseRequired);
    }
}
