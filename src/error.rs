use thiserror::Error;

/// Failures surfaced by the translation layer. Marked non-exhaustive so new
/// variants can be added without breaking the API; most callers only need to
/// react to `FlashError`, the rest indicate caller or configuration bugs.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The requested flash size is not one of the supported capacities, or
    /// the driver reports a smaller device than requested.
    #[error("unsupported flash size")]
    UnsupportedFlashSize,

    /// The underlying flash driver returned an error. The driver-specific
    /// value is discarded. In-memory state stays consistent and uncommitted
    /// buffers stay locked, so a later retry or sync can still complete.
    #[error("flash i/o error")]
    FlashError,

    /// A sector number at or past the usable capacity was requested.
    #[error("sector out of range")]
    SectorOutOfRange,

    /// The caller's buffer is not a whole number of sectors.
    #[error("buffer length is not a multiple of the sector size")]
    UnalignedLength,

    /// Every page buffer holds uncommitted changes. Writes force a sync and
    /// retry internally, so seeing this from a public call means a buffer
    /// stayed pinned through a sync.
    #[error("all page buffers are locked")]
    NoFreeBuffers,

    /// The allocator completed a full revolution without finding a usable
    /// page. The reserved-page headroom makes this unreachable in correct
    /// operation.
    #[error("no allocatable physical page")]
    NoFreePages,
}
