#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use nor_ftl::PAGE_SIZE;
use nor_ftl::platform::ErasedCheck;

// 1 word is the minimum the driver can transfer
pub const WORD_SIZE: usize = 4;

pub const TT_HEADER_SIZE: usize = 16;
pub const TT_PAGE_MAGIC: u32 = 0xEF87_364A;

/// In-RAM NOR flash: writes can only clear bits, erases work on whole
/// pages. Every operation is logged, and faults can be injected either
/// permanently from an operation index on (a power cut) or for exactly one
/// operation (a transient driver failure).
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub fail_once_at: Option<usize>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xFFu8; PAGE_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new(pages)
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_once_at = None;
    }

    fn faulted(&mut self) -> bool {
        if self.operations.len() >= self.fail_after_operation {
            return true;
        }
        if self.fail_once_at == Some(self.operations.len()) {
            self.fail_once_at = None;
            return true;
        }
        false
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    /// Scans for valid master-table headers the way mount does and returns
    /// (physical page, serial) of the newest one.
    pub fn find_mtt(&self) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32)> = None;
        for page_no in 0..self.buf.len() / PAGE_SIZE {
            let header = &self.buf[page_no * PAGE_SIZE..][..TT_HEADER_SIZE];
            if !valid_master_header(header) {
                continue;
            }
            let serial = u32::from_le_bytes(header[8..12].try_into().unwrap());
            if best.is_none_or(|(_, s)| serial > s) {
                best = Some((page_no, serial));
            }
        }
        best
    }

    /// Serials of every page that still carries a valid master-table
    /// header. Orphaned predecessors linger until their page is reused.
    pub fn master_header_serials(&self) -> Vec<u32> {
        (0..self.buf.len() / PAGE_SIZE)
            .map(|page_no| &self.buf[page_no * PAGE_SIZE..][..TT_HEADER_SIZE])
            .filter(|header| valid_master_header(header))
            .map(|header| u32::from_le_bytes(header[8..12].try_into().unwrap()))
            .collect()
    }

    /// True when every page carrying the table magic also carries a header
    /// CRC that checks out.
    pub fn all_table_headers_valid(&self) -> bool {
        (0..self.buf.len() / PAGE_SIZE)
            .map(|page_no| &self.buf[page_no * PAGE_SIZE..][..TT_HEADER_SIZE])
            .filter(|header| {
                u32::from_le_bytes(header[0..4].try_into().unwrap()) == TT_PAGE_MAGIC
            })
            .all(header_crc_valid)
    }
}

fn header_crc_valid(header: &[u8]) -> bool {
    let stored = u16::from_le_bytes(header[14..16].try_into().unwrap());
    let mut covered = [0u8; 14];
    covered.copy_from_slice(&header[..14]);
    covered[12] = 0xFF;
    covered[13] = 0xFF;
    stored == crc16_ccitt(&covered)
}

fn valid_master_header(header: &[u8]) -> bool {
    u32::from_le_bytes(header[0..4].try_into().unwrap()) == TT_PAGE_MAGIC
        && u32::from_le_bytes(header[4..8].try_into().unwrap()) == 0
        && header_crc_valid(header)
}

fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xFF;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR programming can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl ErasedCheck for Flash {
    fn is_erased(&mut self, offset: u32) -> Result<bool, Self::Error> {
        // A state probe, not a transfer: kept out of the operation log so
        // fault indices track programs, erases and reads only.
        let offset = offset as usize;
        Ok(self.buf[offset..offset + PAGE_SIZE].iter().all(|&b| b == 0xFF))
    }
}
