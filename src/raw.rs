//! On-flash layout of a bank.
//!
//! ```text
//! bank:   | Header (8) | Entry | Entry | ... | 0xFF ... 0xFF |
//! header: | 'B' 'T' 's' 't' 'a' 'c' 'k' | status |   status bits 1..0 = epoch
//! entry:  | tag (u32 BE) | len (u32 BE) | value (len bytes) |
//! ```
//!
//! A tag of 0x00000000 marks a deleted or superseded entry, a tag of 0xFFFFFFFF is erased
//! flash and ends the log.

use crate::platform::{FlashBank, align_ceil, align_floor};
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const BANK_HEADER_LEN: u32 = 8;
pub(crate) const ENTRY_HEADER_LEN: u32 = 8;

/// Largest supported read/write granularity of a flash device.
pub const MAX_ALIGNMENT: usize = 16;

pub(crate) const TAG_DELETED: u32 = 0x0000_0000;
pub(crate) const TAG_END: u32 = 0xFFFF_FFFF;

pub(crate) const MAGIC: &[u8; 7] = b"BTstack";
const EPOCH_MASK: u8 = 0b11;

/// One of the two equally sized, independently erasable regions of the device.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Bank {
    Zero = 0,
    One = 1,
}

impl Bank {
    pub const fn other(self) -> Bank {
        match self {
            Bank::Zero => Bank::One,
            Bank::One => Bank::Zero,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Two bit counter stored in the bank header. The bank whose epoch is one ahead (mod 4)
/// of the other one is the current bank.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Epoch(u8);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub const fn from_status(status: u8) -> Self {
        Self(status & EPOCH_MASK)
    }

    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1) & EPOCH_MASK)
    }

    /// True if `self` was written by the migration that followed `other`.
    pub const fn follows(self, other: Epoch) -> bool {
        self.0 == other.next().0
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub(crate) struct Header {
    pub(crate) epoch: Epoch,
}

impl Header {
    /// Returns `None` unless the first seven bytes carry the magic.
    pub(crate) fn decode(raw: &[u8; BANK_HEADER_LEN as usize]) -> Option<Self> {
        if &raw[..MAGIC.len()] != MAGIC {
            return None;
        }
        Some(Self {
            epoch: Epoch::from_status(raw[MAGIC.len()]),
        })
    }

    pub(crate) fn encode(&self) -> [u8; BANK_HEADER_LEN as usize] {
        let mut raw = [0u8; BANK_HEADER_LEN as usize];
        raw[..MAGIC.len()].copy_from_slice(MAGIC);
        // reserved status bits stay zero
        raw[MAGIC.len()] = self.epoch.value();
        raw
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub(crate) struct EntryDescriptor {
    pub(crate) tag: u32,
    pub(crate) len: u32,
}

impl EntryDescriptor {
    pub(crate) fn decode(raw: &[u8; ENTRY_HEADER_LEN as usize]) -> Self {
        Self {
            tag: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            len: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub(crate) fn encode(&self) -> [u8; ENTRY_HEADER_LEN as usize] {
        let mut raw = [0u8; ENTRY_HEADER_LEN as usize];
        raw[..4].copy_from_slice(&self.tag.to_be_bytes());
        raw[4..].copy_from_slice(&self.len.to_be_bytes());
        raw
    }

    /// Bytes occupied by an entry with a value of `len` bytes, including the padding up to
    /// the next aligned entry. `None` if the size does not fit into a `u32`.
    pub(crate) fn stride(len: u32, alignment: u32) -> Option<u32> {
        let size = ENTRY_HEADER_LEN.checked_add(len)?;
        let aligned = align_ceil(size as usize, alignment as usize);
        u32::try_from(aligned).ok()
    }
}

/// Reads `bytes.len()` bytes at an arbitrary `offset`. Partial blocks at either end are read
/// as whole aligned blocks through a scratch buffer.
pub(crate) fn read_aligned<T: FlashBank>(
    hal: &mut T,
    bank: Bank,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), T::Error> {
    let alignment = hal.alignment() as usize;
    let mut offset = offset as usize;
    let mut done = 0;

    let head = offset % alignment;
    if head != 0 {
        let mut block = [0xFFu8; MAX_ALIGNMENT];
        hal.read(bank, (offset - head) as u32, &mut block[..alignment])?;
        let n = cmp::min(alignment - head, bytes.len());
        bytes[..n].copy_from_slice(&block[head..head + n]);
        done += n;
        offset += n;
    }

    let middle = align_floor(bytes.len() - done, alignment);
    if middle > 0 {
        hal.read(bank, offset as u32, &mut bytes[done..done + middle])?;
        done += middle;
        offset += middle;
    }

    if done < bytes.len() {
        let mut block = [0xFFu8; MAX_ALIGNMENT];
        hal.read(bank, offset as u32, &mut block[..alignment])?;
        let n = bytes.len() - done;
        bytes[done..].copy_from_slice(&block[..n]);
    }

    Ok(())
}

/// Writes `bytes` at an aligned `offset`, padding the last partial block with 0xFF.
#[inline(always)]
pub(crate) fn write_aligned<T: FlashBank>(
    hal: &mut T,
    bank: Bank,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned {} @{:#x}: [{}]", bank, offset, bytes.len());

    let alignment = hal.alignment() as usize;
    debug_assert!((offset as usize).is_multiple_of(alignment));

    if bytes.len().is_multiple_of(alignment) {
        hal.write(bank, offset, bytes)
    } else {
        let pivot = align_floor(bytes.len(), alignment);
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(bank, offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = [0xFFu8; MAX_ALIGNMENT];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(bank, offset + (pivot as u32), &buf[..alignment])?
        }

        Ok(())
    }
}
