use thiserror::Error;

/// Errors that can occur during TLV operations. Marked as non-exhaustive to allow for future
/// additions without breaking the API. At runtime a caller would likely only need to handle
/// `Alignment`, `OutOfSpace` and `FlashError`; the geometry errors are static and surface
/// when the store is created.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The value size is not a multiple of the device alignment. Nothing was written.
    #[error("value size violates flash alignment")]
    Alignment,

    /// The value does not fit into a bank even after migrating all live entries.
    /// Nothing was written and a previous value of the tag is still intact.
    #[error("out of space")]
    OutOfSpace,

    /// Tags 0x00000000 (deleted) and 0xFFFFFFFF (erased flash) are reserved.
    #[error("reserved tag")]
    ReservedTag,

    /// The internal error value is returned from the provided flash device.
    #[error("internal flash error")]
    FlashError,

    /// The device alignment has to be a power of two of at most `MAX_ALIGNMENT` bytes.
    #[error("unsupported flash alignment")]
    UnsupportedAlignment,

    /// A bank has to be a multiple of the alignment and large enough for the header and
    /// one entry descriptor.
    #[error("invalid bank size")]
    InvalidBankSize,

    /// The partition offset has to be aligned to the erase size of the flash.
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition has to hold two banks that are each a multiple of the erase size.
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// Only returned by the typed [`Get`](crate::Get) helpers, `get_tag` reports a missing
    /// tag as length 0.
    #[error("tag not found")]
    TagNotFound,

    /// A fixed size read found a stored value of a different length.
    #[error("length mismatch: stored value has {0} bytes")]
    LengthMismatch(usize),
}
