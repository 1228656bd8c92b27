use crate::error::Error;
use crate::platform::{AlignedOps, FlashBank};
use crate::raw::{
    BANK_HEADER_LEN, Bank, ENTRY_HEADER_LEN, EntryDescriptor, TAG_END, read_aligned,
};
#[cfg(feature = "defmt")]
use defmt::warn;

/// Walks the entry log of one bank. Holds no borrow of the device, so the caller may write
/// to the bank between two steps.
pub(crate) struct EntryIterator {
    pub(crate) bank: Bank,
    pub(crate) offset: u32,
    pub(crate) tag: u32,
    pub(crate) len: u32,
    size: u32,
}

impl EntryIterator {
    pub(crate) fn new<T: FlashBank>(hal: &mut T, bank: Bank) -> Result<Self, Error> {
        let mut it = Self {
            bank,
            offset: hal.align_ceil(BANK_HEADER_LEN),
            tag: TAG_END,
            len: 0,
            size: hal.size(),
        };
        it.fetch(hal)?;
        Ok(it)
    }

    pub(crate) fn has_next(&self) -> bool {
        self.tag != TAG_END
    }

    /// Bytes the current entry occupies including alignment padding.
    pub(crate) fn stride<T: FlashBank>(&self, hal: &T) -> u32 {
        // fetch only accepts entries whose stride fits into the bank
        EntryDescriptor::stride(self.len, hal.alignment()).unwrap_or(self.size)
    }

    pub(crate) fn value_offset(&self) -> u32 {
        self.offset + ENTRY_HEADER_LEN
    }

    pub(crate) fn advance<T: FlashBank>(&mut self, hal: &mut T) -> Result<(), Error> {
        self.offset = self.offset.saturating_add(self.stride(&*hal));

        if self.offset >= self.size {
            self.end();
            return Ok(());
        }
        self.fetch(hal)
    }

    fn fetch<T: FlashBank>(&mut self, hal: &mut T) -> Result<(), Error> {
        // descriptor doesn't fit into remaining space
        if self.offset.saturating_add(ENTRY_HEADER_LEN) > self.size {
            self.end();
            return Ok(());
        }

        let mut raw = [0u8; ENTRY_HEADER_LEN as usize];
        read_aligned(hal, self.bank, self.offset, &mut raw).map_err(|_| Error::FlashError)?;
        let descriptor = EntryDescriptor::decode(&raw);

        if descriptor.tag == TAG_END {
            self.end();
            return Ok(());
        }

        // a length running past the bank can only come from a torn or corrupted descriptor.
        // Stop here, the bytes from this offset on are treated as unwritten garbage.
        let fits = EntryDescriptor::stride(descriptor.len, hal.alignment())
            .and_then(|stride| self.offset.checked_add(stride))
            .is_some_and(|end| end <= self.size);
        if !fits {
            #[cfg(feature = "defmt")]
            warn!(
                "entry @{:#x} in bank {} exceeds bank: len {}",
                self.offset, self.bank, descriptor.len
            );

            #[cfg(feature = "debug-logs")]
            println!(
                "  iter: entry @{:#x} in bank {} exceeds bank: len {}",
                self.offset, self.bank, descriptor.len
            );

            self.end();
            return Ok(());
        }

        self.tag = descriptor.tag;
        self.len = descriptor.len;
        Ok(())
    }

    fn end(&mut self) {
        self.tag = TAG_END;
        self.len = 0;
    }
}
