use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::raw::PAGE_SIZE;

/// Blank check for a single flash page.
///
/// The default implementation reads the page back and compares against the
/// erased pattern. Hosts whose flash exposes a faster path (a blank-check
/// command, or a driver-side erase map) should override it.
pub trait ErasedCheck: ReadNorFlash {
    /// Reports whether the page starting at `offset` is fully erased.
    /// `offset` is page-aligned.
    fn is_erased(&mut self, offset: u32) -> Result<bool, Self::Error> {
        let mut chunk = [0u8; 64];
        let mut pos = 0;
        while pos < PAGE_SIZE {
            self.read(offset + pos as u32, &mut chunk)?;
            if chunk.iter().any(|&byte| byte != 0xFF) {
                return Ok(false);
            }
            pos += chunk.len();
        }
        Ok(true)
    }
}

impl<T: ErasedCheck> ErasedCheck for &mut T {
    fn is_erased(&mut self, offset: u32) -> Result<bool, Self::Error> {
        T::is_erased(self, offset)
    }
}

/// Everything the translation layer needs from the host flash driver:
/// page-granular program and erase through the `embedded-storage` NOR
/// traits, plus the blank check.
pub trait Platform: NorFlash + ErasedCheck {}

impl<T: NorFlash + ErasedCheck> Platform for T {}
