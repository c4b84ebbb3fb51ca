//! Sector read path.

#[cfg(feature = "defmt")]
use defmt::trace;

use crate::Ftl;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{SECTOR_SIZE, SECTORS_PER_PAGE};

impl<T: Platform> Ftl<T> {
    /// Reads one sector into `buf` (exactly [`SECTOR_SIZE`] bytes). A
    /// sector never written since its page's last erase reads back as 0xFF
    /// without touching flash; everything else is served through the page
    /// cache, so unsynced writes are visible.
    ///
    /// [`SECTOR_SIZE`]: crate::SECTOR_SIZE
    pub fn read_sector(&mut self, sector_no: u32, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::UnalignedLength);
        }
        if sector_no >= self.usable_sector_count {
            return Err(Error::SectorOutOfRange);
        }

        #[cfg(feature = "defmt")]
        trace!("read_sector: {}", sector_no);

        let logical_page_no = (sector_no / SECTORS_PER_PAGE) as u16 + self.tt_page_count;
        let page_sector_no = (sector_no % SECTORS_PER_PAGE) as u8;

        let info = self.read_page_info(logical_page_no)?;
        if info.sect_status & (1 << page_sector_no) != 0 {
            buf.fill(0xFF);
            return Ok(());
        }

        let idx = self
            .cache
            .load(&mut self.hal, logical_page_no as i16, info.physical_page_no)?;
        let offset = page_sector_no as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.cache.slots[idx].page[offset..offset + SECTOR_SIZE]);
        Ok(())
    }
}
