//! Translation-table access, the physical page allocator, the page
//! programmer behind sync, and mount/format.

use alloc::vec;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

use crate::Ftl;
use crate::buffer::ProgramMode;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    self, PAGE_SIZE, PageInfo, TT_HEADER_SIZE, TT_PAGE_MAGIC, TT_RECORDS_PER_PAGE, TtHeader,
};
use crate::state::PhysicalPageState;

pub(crate) fn page_address(physical_page_no: i16) -> u32 {
    debug_assert!(physical_page_no >= 0);
    physical_page_no as u16 as u32 * PAGE_SIZE as u32
}

impl<T: Platform> Ftl<T> {
    fn read_physical_page_info(
        &mut self,
        logical_page_no: i16,
        physical_page_no: i16,
        record_no: usize,
    ) -> Result<PageInfo, Error> {
        let idx = self
            .cache
            .load(&mut self.hal, logical_page_no, physical_page_no)?;
        let offset = raw::record_offset(record_no);
        Ok(PageInfo::read_from(
            &self.cache.slots[idx].page[offset..offset + raw::PAGE_INFO_SIZE],
        ))
    }

    /// Writes a record into its translation page's buffer and pins the
    /// buffer for the next sync. A plain record update never forces a
    /// relocation by itself; whether a bit needs raising is the writer's
    /// call.
    fn update_physical_page_info(
        &mut self,
        info: PageInfo,
        logical_page_no: i16,
        physical_page_no: i16,
        record_no: usize,
    ) -> Result<(), Error> {
        let idx = self
            .cache
            .load(&mut self.hal, logical_page_no, physical_page_no)?;
        let slot = &mut self.cache.slots[idx];
        slot.lock = true;
        if slot.p_mode == ProgramMode::None {
            slot.p_mode = ProgramMode::Program;
        }
        let offset = raw::record_offset(record_no);
        info.write_to(&mut slot.page[offset..offset + raw::PAGE_INFO_SIZE]);
        Ok(())
    }

    /// Record describing `logical_page_no`: straight out of the master
    /// table for low page numbers, through the owning secondary table
    /// otherwise.
    pub(crate) fn read_page_info(&mut self, logical_page_no: u16) -> Result<PageInfo, Error> {
        if (logical_page_no as usize) < TT_RECORDS_PER_PAGE {
            self.read_physical_page_info(0, self.mtt_physical_page_no, logical_page_no as usize)
        } else {
            let stt_logical_page_no = logical_page_no / TT_RECORDS_PER_PAGE as u16;
            let stt = self.read_physical_page_info(
                0,
                self.mtt_physical_page_no,
                stt_logical_page_no as usize,
            )?;
            self.read_physical_page_info(
                stt_logical_page_no as i16,
                stt.physical_page_no,
                logical_page_no as usize % TT_RECORDS_PER_PAGE,
            )
        }
    }

    pub(crate) fn update_page_info(
        &mut self,
        info: PageInfo,
        logical_page_no: u16,
    ) -> Result<(), Error> {
        if (logical_page_no as usize) < TT_RECORDS_PER_PAGE {
            self.update_physical_page_info(
                info,
                0,
                self.mtt_physical_page_no,
                logical_page_no as usize,
            )
        } else {
            let stt_logical_page_no = logical_page_no / TT_RECORDS_PER_PAGE as u16;
            let stt = self.read_physical_page_info(
                0,
                self.mtt_physical_page_no,
                stt_logical_page_no as usize,
            )?;
            self.update_physical_page_info(
                info,
                stt_logical_page_no as i16,
                stt.physical_page_no,
                logical_page_no as usize % TT_RECORDS_PER_PAGE,
            )
        }
    }

    /// Next physical page the frontier can hand out. Any state but USED
    /// qualifies; the programmer decides whether an erase is still needed
    /// and flips the state once its program succeeds.
    pub(crate) fn allocate_physical_page(&mut self) -> Result<i16, Error> {
        let mut lookups: u32 = 0;
        while self.page_state.get(self.write_frontier) == PhysicalPageState::Used {
            self.advance_frontier();
            lookups += 1;
            if lookups > self.physical_page_count as u32 {
                #[cfg(feature = "defmt")]
                warn!("allocator found no free page in a full revolution");
                return Err(Error::NoFreePages);
            }
        }
        let physical_page_no = self.write_frontier as i16;
        self.advance_frontier();
        Ok(physical_page_no)
    }

    fn advance_frontier(&mut self) {
        self.write_frontier += 1;
        if self.write_frontier >= self.physical_page_count {
            self.write_frontier = 0;
        }
    }

    fn erase_unless_blank(&mut self, physical_page_no: i16) -> Result<(), Error> {
        if self.page_state.get(physical_page_no as u16) != PhysicalPageState::Erased {
            let addr = page_address(physical_page_no);
            self.hal
                .erase(addr, addr + PAGE_SIZE as u32)
                .map_err(|_| Error::FlashError)?;
        }
        Ok(())
    }

    /// Commits one locked buffer to flash according to its program mode.
    pub(crate) fn program_buffer(&mut self, idx: usize) -> Result<(), Error> {
        match self.cache.slots[idx].p_mode {
            ProgramMode::None => Ok(()),
            ProgramMode::Program => {
                let physical_page_no = self.cache.slots[idx].physical_page_no;
                self.hal
                    .write(page_address(physical_page_no), &self.cache.slots[idx].page)
                    .map_err(|_| Error::FlashError)?;
                self.page_state
                    .set(physical_page_no as u16, PhysicalPageState::Used);
                Ok(())
            }
            ProgramMode::EraseProgram => {
                let physical_page_no = self.cache.slots[idx].physical_page_no;
                self.erase_unless_blank(physical_page_no)?;
                self.hal
                    .write(page_address(physical_page_no), &self.cache.slots[idx].page)
                    .map_err(|_| Error::FlashError)?;
                self.page_state
                    .set(physical_page_no as u16, PhysicalPageState::Used);
                Ok(())
            }
            ProgramMode::RelocateEraseProgram => self.relocate_buffer(idx),
        }
    }

    /// Copy-on-write commit: program the buffer onto a newly allocated page
    /// and orphan the one it came from. The old page keeps its USED state
    /// until the new copy has programmed, so a fault anywhere in between
    /// leaves the previous image intact and retryable.
    fn relocate_buffer(&mut self, idx: usize) -> Result<(), Error> {
        let new_physical_page_no = self.allocate_physical_page()?;
        let logical_page_no = self.cache.slots[idx].logical_page_no;

        if logical_page_no >= 0 && (logical_page_no as u16) < self.tt_page_count {
            let slot = &mut self.cache.slots[idx];
            if logical_page_no == 0 {
                // Record 0 of the master table points at the master table
                // itself; patch it before the CRC covers the header.
                let offset = raw::record_offset(0);
                let mut self_info =
                    PageInfo::read_from(&slot.page[offset..offset + raw::PAGE_INFO_SIZE]);
                self_info.physical_page_no = new_physical_page_no;
                self_info.write_to(&mut slot.page[offset..offset + raw::PAGE_INFO_SIZE]);
            }
            let mut header = TtHeader::decode(&slot.page[..TT_HEADER_SIZE]);
            header.serial += 1;
            header.padding = 0xFFFF;
            header.crc16 = header.calculate_crc16();
            slot.page[..TT_HEADER_SIZE].copy_from_slice(&header.encode());

            #[cfg(feature = "defmt")]
            trace!(
                "relocating table page {} to physical {}",
                logical_page_no, new_physical_page_no
            );
        }

        self.erase_unless_blank(new_physical_page_no)?;
        self.hal
            .write(
                page_address(new_physical_page_no),
                &self.cache.slots[idx].page,
            )
            .map_err(|_| Error::FlashError)?;

        let old_physical_page_no = self.cache.slots[idx].physical_page_no;
        self.page_state
            .set(old_physical_page_no as u16, PhysicalPageState::EraseRequired);
        self.cache.slots[idx].physical_page_no = new_physical_page_no;
        self.page_state
            .set(new_physical_page_no as u16, PhysicalPageState::Used);
        if logical_page_no == 0 {
            self.mtt_physical_page_no = new_physical_page_no;
        }
        Ok(())
    }

    /// Scans the device for the newest valid master table and rebuilds the
    /// volatile state from it. `Ok(false)` means no candidate exists, i.e.
    /// a blank or foreign medium.
    pub(crate) fn mount(&mut self) -> Result<bool, Error> {
        let mut best_serial: u32 = 0;
        let mut best_page: Option<u16> = None;
        let mut bytes = [0u8; TT_HEADER_SIZE];
        for page_no in 0..self.physical_page_count {
            self.hal
                .read(page_no as u32 * PAGE_SIZE as u32, &mut bytes)
                .map_err(|_| Error::FlashError)?;
            let header = TtHeader::decode(&bytes);
            if header.magic == TT_PAGE_MAGIC
                && header.logical_page_no == 0
                && header.crc16 == header.calculate_crc16()
                && header.serial > best_serial
            {
                best_serial = header.serial;
                best_page = Some(page_no);
            }
        }
        let Some(mtt_page_no) = best_page else {
            return Ok(false);
        };

        #[cfg(feature = "defmt")]
        trace!(
            "mount: master table at physical {} serial {}",
            mtt_page_no, best_serial
        );

        self.mtt_physical_page_no = mtt_page_no as i16;
        self.page_state.set(mtt_page_no, PhysicalPageState::Used);
        self.write_frontier = mtt_page_no + 1;
        if self.write_frontier >= self.physical_page_count {
            self.write_frontier = 0;
        }

        for record_no in 1..TT_RECORDS_PER_PAGE {
            let info = self.read_physical_page_info(0, self.mtt_physical_page_no, record_no)?;
            if info.physical_page_no < 0 {
                continue;
            }
            self.page_state
                .set(info.physical_page_no as u16, PhysicalPageState::Used);
            if record_no < self.tt_page_count as usize {
                let stt_idx =
                    self.cache
                        .load(&mut self.hal, record_no as i16, info.physical_page_no)?;
                for stt_record_no in 0..TT_RECORDS_PER_PAGE {
                    let offset = raw::record_offset(stt_record_no);
                    let data_info = PageInfo::read_from(
                        &self.cache.slots[stt_idx].page[offset..offset + raw::PAGE_INFO_SIZE],
                    );
                    if data_info.physical_page_no >= 0 {
                        self.page_state
                            .set(data_info.physical_page_no as u16, PhysicalPageState::Used);
                    }
                }
            }
        }

        let window = self.cache.len() as u16;
        self.page_state
            .resolve_unknown(&mut self.hal, self.write_frontier, window)?;
        Ok(true)
    }

    /// Lays a fresh table set onto the medium: blank secondary tables at
    /// physical pages 1..tt_page_count, then the master table at physical
    /// page 0 referencing them.
    pub(crate) fn format(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("format: {} translation pages", self.tt_page_count);

        self.write_frontier = 0;
        let window = self.cache.len() as u16;
        self.page_state.resolve_unknown(&mut self.hal, 0, window)?;

        let mut mtt = vec![0xFFu8; PAGE_SIZE];
        mtt[..TT_HEADER_SIZE].copy_from_slice(&TtHeader::new(0, 1).encode());
        let offset = raw::record_offset(0);
        PageInfo {
            physical_page_no: 0,
            sect_status: 0,
        }
        .write_to(&mut mtt[offset..offset + raw::PAGE_INFO_SIZE]);

        for tt_page_no in 1..self.tt_page_count {
            let mut stt = vec![0xFFu8; PAGE_SIZE];
            stt[..TT_HEADER_SIZE].copy_from_slice(&TtHeader::new(tt_page_no as u32, 1).encode());
            let physical_page_no = tt_page_no as i16;
            self.erase_unless_blank(physical_page_no)?;
            self.hal
                .write(page_address(physical_page_no), &stt)
                .map_err(|_| Error::FlashError)?;
            self.page_state.set(tt_page_no, PhysicalPageState::Used);

            let offset = raw::record_offset(tt_page_no as usize);
            PageInfo {
                physical_page_no,
                sect_status: 0,
            }
            .write_to(&mut mtt[offset..offset + raw::PAGE_INFO_SIZE]);
        }

        self.erase_unless_blank(0)?;
        self.hal.write(0, &mtt).map_err(|_| Error::FlashError)?;
        self.page_state.set(0, PhysicalPageState::Used);
        self.mtt_physical_page_no = 0;
        self.write_frontier = self.tt_page_count;
        Ok(())
    }
}
