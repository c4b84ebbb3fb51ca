//! Sector writes and the ordered flush that makes them durable.

#[cfg(feature = "defmt")]
use defmt::trace;

use crate::Ftl;
use crate::buffer::ProgramMode;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{self, PageInfo, SECTOR_SIZE, SECTORS_PER_PAGE, TT_RECORDS_PER_PAGE};

/// Worst-case slots one sector write can dirty: the data page, its
/// secondary table, and the master table, all relocating at once.
const WRITE_WORKING_SET: usize = 3;

impl<T: Platform> Ftl<T> {
    /// Writes whole sectors starting at `start_sector_no`; `buf` holds one
    /// or more sectors back to back. Nothing reaches flash until
    /// [`Ftl::sync`] runs, but reads issued in between already see the new
    /// contents.
    pub fn write_sectors(&mut self, start_sector_no: u32, buf: &[u8]) -> Result<(), Error> {
        if !buf.len().is_multiple_of(SECTOR_SIZE) {
            return Err(Error::UnalignedLength);
        }
        let sector_count = (buf.len() / SECTOR_SIZE) as u32;
        let end = start_sector_no
            .checked_add(sector_count)
            .ok_or(Error::SectorOutOfRange)?;
        if end > self.usable_sector_count {
            return Err(Error::SectorOutOfRange);
        }

        // Keep state resolution ahead of the allocator.
        self.page_state
            .resolve_unknown(&mut self.hal, self.write_frontier, self.tt_page_count)?;

        #[cfg(feature = "defmt")]
        trace!("write_sectors: {} + {}", start_sector_no, sector_count);

        for (i, sector) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_one_sector(start_sector_no + i as u32, sector)?;
        }
        Ok(())
    }

    fn write_one_sector(&mut self, sector_no: u32, sector: &[u8]) -> Result<(), Error> {
        if !self.cache.has_free(WRITE_WORKING_SET) {
            self.sync()?;
        }

        let logical_page_no = (sector_no / SECTORS_PER_PAGE) as u16 + self.tt_page_count;
        let page_sector_no = (sector_no % SECTORS_PER_PAGE) as u8;

        let mut info = self.read_page_info(logical_page_no)?;

        let data_idx = if info.physical_page_no < 0 {
            // Never-mapped logical page: claim a physical page for it. The
            // slot starts blank and locked, armed for erase-and-program.
            info.physical_page_no = self.allocate_physical_page()?;
            info.sect_status = 0xFF;
            let idx = self.cache.init(logical_page_no as i16, info.physical_page_no)?;
            self.update_page_info(info, logical_page_no)?;
            idx
        } else {
            self.cache
                .load(&mut self.hal, logical_page_no as i16, info.physical_page_no)?
        };

        let mask = 1u8 << page_sector_no;
        let offset = page_sector_no as usize * SECTOR_SIZE;
        if info.sect_status & mask != 0 {
            // First write since the erase: the sector programs in place.
            info.sect_status &= !mask;
            self.update_page_info(info, logical_page_no)?;

            let slot = &mut self.cache.slots[data_idx];
            slot.lock = true;
            if slot.p_mode == ProgramMode::None {
                slot.p_mode = ProgramMode::Program;
            }
            slot.page[offset..offset + SECTOR_SIZE].copy_from_slice(sector);
        } else {
            // Rewrite: a bit would have to come back up, so the page moves,
            // and so does every table on the path down to it.
            let slot = &mut self.cache.slots[data_idx];
            slot.lock = true;
            slot.p_mode = ProgramMode::RelocateEraseProgram;
            slot.page[offset..offset + SECTOR_SIZE].copy_from_slice(sector);

            let tt_page_no = logical_page_no / TT_RECORDS_PER_PAGE as u16;
            let tt_info = self.read_page_info(tt_page_no)?;
            let tt_idx =
                self.cache
                    .load(&mut self.hal, tt_page_no as i16, tt_info.physical_page_no)?;
            let tt_slot = &mut self.cache.slots[tt_idx];
            tt_slot.lock = true;
            tt_slot.p_mode = ProgramMode::RelocateEraseProgram;

            if tt_page_no > 0 {
                let mtt_idx = self.cache.load(&mut self.hal, 0, self.mtt_physical_page_no)?;
                let mtt_slot = &mut self.cache.slots[mtt_idx];
                mtt_slot.lock = true;
                mtt_slot.p_mode = ProgramMode::RelocateEraseProgram;
            }
        }
        Ok(())
    }

    /// Flushes every locked buffer in dependency order: data pages first,
    /// then the secondary tables that name them, then the master table that
    /// names the secondaries. A power cut between any two steps leaves the
    /// previous master-table image and the table set it references intact
    /// on flash, so mount falls back to the last synced state.
    pub fn sync(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("sync");

        // Data pages, then their table records.
        for idx in 0..self.cache.len() {
            if !self.cache.slots[idx].lock {
                continue;
            }
            let logical_page_no = self.cache.slots[idx].logical_page_no;
            if logical_page_no >= self.tt_page_count as i16 {
                self.program_buffer(idx)?;

                let mut info = self.read_page_info(logical_page_no as u16)?;
                info.physical_page_no = self.cache.slots[idx].physical_page_no;
                self.update_page_info(info, logical_page_no as u16)?;

                let slot = &mut self.cache.slots[idx];
                slot.lock = false;
                slot.p_mode = ProgramMode::None;
            }
        }

        // Keep the master table resident through the next phase.
        let mtt_idx = self.cache.load(&mut self.hal, 0, self.mtt_physical_page_no)?;

        // Secondary tables, patching their master-table records.
        for idx in 0..self.cache.len() {
            if !self.cache.slots[idx].lock {
                continue;
            }
            let logical_page_no = self.cache.slots[idx].logical_page_no;
            if logical_page_no > 0 && logical_page_no < self.tt_page_count as i16 {
                self.program_buffer(idx)?;

                let new_physical_page_no = self.cache.slots[idx].physical_page_no;
                let offset = raw::record_offset(logical_page_no as usize);
                let mtt_page = &mut self.cache.slots[mtt_idx].page;
                let mut record =
                    PageInfo::read_from(&mtt_page[offset..offset + raw::PAGE_INFO_SIZE]);
                record.physical_page_no = new_physical_page_no;
                record.write_to(&mut mtt_page[offset..offset + raw::PAGE_INFO_SIZE]);

                let slot = &mut self.cache.slots[idx];
                slot.lock = false;
                slot.p_mode = ProgramMode::None;
            }
        }

        // The master table goes last.
        if self.cache.slots[mtt_idx].lock {
            self.program_buffer(mtt_idx)?;
            let slot = &mut self.cache.slots[mtt_idx];
            slot.lock = false;
            slot.p_mode = ProgramMode::None;
        }
        Ok(())
    }
}
