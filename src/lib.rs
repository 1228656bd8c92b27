#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod get;
mod internal;
mod iter;
pub mod platform;
mod raw;

pub use get::Get;
pub use raw::{Bank, Epoch, MAX_ALIGNMENT};

extern crate alloc;

use crate::error::Error;
use crate::iter::EntryIterator;
use crate::platform::{AlignedOps, FlashBank};
use crate::raw::{ENTRY_HEADER_LEN, EntryDescriptor, TAG_DELETED, TAG_END};
use core::{cmp, fmt};
#[cfg(feature = "defmt")]
use defmt::trace;

/// A 32-bit key. Tags are usually built from four characters, e.g. `Tag::from_array(b"SMIR")`.
///
/// 0x00000000 and 0xFFFFFFFF are reserved by the on-flash format and can't be stored.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tag(u32);

impl Tag {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Creates a tag from four characters, the first one ends up in the most significant byte.
    ///
    /// Tip: use a const context to build the tag at compile time:
    ///   `const LINK_KEY: Tag = Tag::from_array(b"BTL0");`
    pub const fn from_array(src: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*src))
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 == TAG_DELETED || self.0 == TAG_END
    }
}

impl From<u32> for Tag {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "Tag(b\"")?;
            for &byte in &bytes {
                write!(f, "{}", byte as char)?;
            }
            write!(f, "\")")
        } else {
            write!(f, "Tag({:#010x})", self.0)
        }
    }
}

/// Tag based persistent storage, implemented by [`FlashTlv`]. Stack components that persist
/// keys only need this interface.
pub trait Tlv {
    /// Copies the value of `tag` into `buffer` and returns the number of copied bytes. Without a
    /// buffer the length of the stored value is returned. Returns 0 for missing tags.
    fn get_tag(&mut self, tag: Tag, buffer: Option<&mut [u8]>) -> Result<usize, Error>;

    /// Stores `data` under `tag`, replacing an earlier value.
    fn store_tag(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error>;

    /// Removes `tag`. Missing tags are ignored.
    fn delete_tag(&mut self, tag: Tag) -> Result<(), Error>;
}

impl<T: Tlv + ?Sized> Tlv for &mut T {
    fn get_tag(&mut self, tag: Tag, buffer: Option<&mut [u8]>) -> Result<usize, Error> {
        (**self).get_tag(tag, buffer)
    }

    fn store_tag(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error> {
        (**self).store_tag(tag, data)
    }

    fn delete_tag(&mut self, tag: Tag) -> Result<(), Error> {
        (**self).delete_tag(tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlvStatistics {
    pub current_bank: Bank,
    pub epoch: Epoch,
    pub bank_size: u32,
    pub write_offset: u32,
    pub free_bytes: u32,
    /// Entries with a valid tag.
    pub live_entries: u32,
    /// Deleted or superseded records waiting for the next migration.
    pub deleted_entries: u32,
}

/// Dual bank log of tag-length-value entries.
///
/// New values are appended to the current bank. Older copies of a tag are invalidated in
/// place by zeroing their tag. Once the current bank is full, all live entries are migrated to
/// the other bank, which then becomes the current one. Only whole banks are ever erased.
pub struct FlashTlv<T: FlashBank> {
    pub(crate) hal: T,
    pub(crate) current_bank: Bank,
    pub(crate) write_offset: u32,
    pub(crate) faulted: bool,
}

impl<T: FlashBank> FlashTlv<T> {
    /// Reads both bank headers, selects the current bank and repairs interrupted operations:
    /// 1. The bank with the newer epoch becomes the current bank
    /// 2. The write offset is placed after the last valid entry
    /// 3. Older copies of the last written tag are invalidated
    /// 4. Garbage after the last valid entry is cleaned up by migrating to the other bank
    ///
    /// If neither bank carries a valid header (first boot or corruption) both banks are erased
    /// and the store starts out empty. This silently drops whatever data was left.
    pub fn new(hal: T) -> Result<FlashTlv<T>, Error> {
        platform::check_geometry(&hal)?;

        let mut tlv = Self {
            hal,
            current_bank: Bank::Zero,
            write_offset: 0,
            faulted: false,
        };
        tlv.recover()?;

        Ok(tlv)
    }

    /// Get the value of a tag. See [`Tlv::get_tag`].
    ///
    /// If a tag is present multiple times, the last entry wins. A missing tag and an empty
    /// value both report 0; use [`get`](FlashTlv::get) if the difference matters.
    pub fn get_tag(&mut self, tag: Tag, buffer: Option<&mut [u8]>) -> Result<usize, Error> {
        let Some((value_offset, len)) = self.find(tag)? else {
            return Ok(0);
        };
        let Some(buffer) = buffer else {
            return Ok(len as usize);
        };

        let copy_size = cmp::min(buffer.len(), len as usize);
        self.read(self.current_bank, value_offset, &mut buffer[..copy_size])?;
        Ok(copy_size)
    }

    /// Get a value as a typed object. Supported are `Vec<u8>` and `[u8; N]`.
    pub fn get<R>(&mut self, tag: Tag) -> Result<R, Error>
    where
        FlashTlv<T>: Get<R>,
    {
        Get::get(self, tag)
    }

    /// Appends a new entry for `tag`, migrating to the other bank first if the current one is
    /// full.
    ///
    /// The size of `data` has to be a multiple of the flash alignment. On
    /// [`Error::OutOfSpace`] nothing is written and a previous value stays readable.
    pub fn store_tag(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        match self.append(tag, data) {
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            result => result,
        }
    }

    /// Invalidates every entry of `tag`. Ignores missing tags.
    pub fn delete_tag(&mut self, tag: Tag) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if tag.is_reserved() {
            return Ok(());
        }

        match self.delete_tag_until_offset(tag.value(), self.write_offset) {
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            result => result,
        }
    }

    /// Returns true if the tag is stored, even with an empty value.
    pub fn contains_tag(&mut self, tag: Tag) -> Result<bool, Error> {
        Ok(self.find(tag)?.is_some())
    }

    pub fn current_bank(&self) -> Bank {
        self.current_bank
    }

    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Releases the flash device.
    pub fn into_inner(self) -> T {
        self.hal
    }

    pub fn statistics(&mut self) -> Result<TlvStatistics, Error> {
        let epoch = self
            .read_header(self.current_bank)?
            .map(|header| header.epoch)
            .ok_or(Error::FlashError)?;

        let mut live_entries = 0;
        let mut deleted_entries = 0;
        let mut it = EntryIterator::new(&mut self.hal, self.current_bank)?;
        while it.has_next() {
            if it.tag == TAG_DELETED {
                deleted_entries += 1;
            } else {
                live_entries += 1;
            }
            it.advance(&mut self.hal)?;
        }

        let bank_size = self.hal.size();
        Ok(TlvStatistics {
            current_bank: self.current_bank,
            epoch,
            bank_size,
            write_offset: self.write_offset,
            free_bytes: bank_size.saturating_sub(self.write_offset),
            live_entries,
            deleted_entries,
        })
    }

    /// Offset and length of the value of the last entry carrying `tag`.
    pub(crate) fn find(&mut self, tag: Tag) -> Result<Option<(u32, u32)>, Error> {
        if tag.is_reserved() {
            return Ok(None);
        }

        let mut found = None;
        let mut it = EntryIterator::new(&mut self.hal, self.current_bank)?;
        while it.has_next() {
            if it.tag == tag.value() {
                #[cfg(feature = "defmt")]
                trace!("find: {} @{:#x}", tag, it.offset);

                found = Some((it.value_offset(), it.len));
            }
            it.advance(&mut self.hal)?;
        }
        Ok(found)
    }

    fn fits(&self, stride: u32) -> bool {
        self.write_offset
            .checked_add(stride)
            .is_some_and(|end| end <= self.hal.size())
    }

    fn append(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error> {
        if tag.is_reserved() {
            return Err(Error::ReservedTag);
        }
        if !self.hal.is_aligned(data.len()) {
            return Err(Error::Alignment);
        }

        let alignment = self.hal.alignment();
        let len = u32::try_from(data.len()).map_err(|_| Error::OutOfSpace)?;
        let stride = EntryDescriptor::stride(len, alignment).ok_or(Error::OutOfSpace)?;

        if !self.fits(stride) {
            self.migrate()?;
        }
        if !self.fits(stride) {
            #[cfg(feature = "defmt")]
            defmt::error!("couldn't write entry, not enough space left");

            #[cfg(feature = "debug-logs")]
            println!("FlashTlv: couldn't write entry, not enough space left");

            return Err(Error::OutOfSpace);
        }

        #[cfg(feature = "defmt")]
        trace!("store: {} len {} @{:#x}", tag, len, self.write_offset);

        #[cfg(feature = "debug-logs")]
        println!(
            "FlashTlv: store {:?}, len {} @{:#x}",
            tag, len, self.write_offset
        );

        let mut head = [0xFFu8; MAX_ALIGNMENT];
        head[..ENTRY_HEADER_LEN as usize].copy_from_slice(
            &EntryDescriptor {
                tag: tag.value(),
                len,
            }
            .encode(),
        );
        let mut head_len = ENTRY_HEADER_LEN as usize;
        let mut value = data;
        let mut value_offset = self.write_offset + ENTRY_HEADER_LEN;

        // the descriptor has to be written as one aligned block, fill it up with value bytes
        if alignment > ENTRY_HEADER_LEN {
            let from_value = cmp::min(alignment - ENTRY_HEADER_LEN, len) as usize;
            head[head_len..head_len + from_value].copy_from_slice(&value[..from_value]);
            head_len += from_value;
            value = &value[from_value..];
            value_offset = self.write_offset + alignment;
        }

        // value first, the descriptor commits the entry
        if !value.is_empty() {
            self.write(self.current_bank, value_offset, value)?;
        }
        self.write(self.current_bank, self.write_offset, &head[..head_len])?;

        self.delete_tag_until_offset(tag.value(), self.write_offset)?;

        self.write_offset += stride;
        Ok(())
    }
}

impl<T: FlashBank> Tlv for FlashTlv<T> {
    fn get_tag(&mut self, tag: Tag, buffer: Option<&mut [u8]>) -> Result<usize, Error> {
        FlashTlv::get_tag(self, tag, buffer)
    }

    fn store_tag(&mut self, tag: Tag, data: &[u8]) -> Result<(), Error> {
        FlashTlv::store_tag(self, tag, data)
    }

    fn delete_tag(&mut self, tag: Tag) -> Result<(), Error> {
        FlashTlv::delete_tag(self, tag)
    }
}
