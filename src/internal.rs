use crate::FlashTlv;
use crate::error::Error;
use crate::iter::EntryIterator;
use crate::platform::{AlignedOps, FlashBank};
use crate::raw::{
    BANK_HEADER_LEN, Bank, Epoch, Header, TAG_DELETED, read_aligned, write_aligned,
};
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::{info, trace, warn};

/// Migration streams entries through a buffer of this size.
const COPY_BUFFER_SIZE: usize = 32;
const ERASED_CHECK_CHUNK: usize = 16;

/// A tag can only be zeroed on its own if the device writes in units of at most 4 bytes.
const MAX_TAG_ONLY_ALIGNMENT: u32 = 4;

impl<T: FlashBank> FlashTlv<T> {
    pub(crate) fn read(&mut self, bank: Bank, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        read_aligned(&mut self.hal, bank, offset, bytes).map_err(|_| Error::FlashError)
    }

    pub(crate) fn write(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        write_aligned(&mut self.hal, bank, offset, bytes).map_err(|_| Error::FlashError)
    }

    pub(crate) fn read_header(&mut self, bank: Bank) -> Result<Option<Header>, Error> {
        let mut raw = [0u8; BANK_HEADER_LEN as usize];
        self.read(bank, 0, &mut raw)?;
        Ok(Header::decode(&raw))
    }

    fn write_header(&mut self, bank: Bank, epoch: Epoch) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_header: bank {} epoch {}", bank, epoch);

        let raw = Header { epoch }.encode();
        self.write(bank, 0, &raw)
    }

    /// Checks both banks for headers and picks the one whose epoch is one ahead.
    /// Returns `None` if no bank can be trusted.
    fn latest_bank(&mut self) -> Result<Option<Bank>, Error> {
        let header0 = self.read_header(Bank::Zero)?;
        let header1 = self.read_header(Bank::One)?;

        let bank = match (header0, header1) {
            (None, None) => None,
            (Some(_), None) => Some(Bank::Zero),
            (None, Some(_)) => Some(Bank::One),
            (Some(h0), Some(h1)) if h0.epoch.follows(h1.epoch) => Some(Bank::Zero),
            (Some(h0), Some(h1)) if h1.epoch.follows(h0.epoch) => Some(Bank::One),
            // both banks are always exactly one migration apart, must not happen
            (Some(_), Some(_)) => None,
        };
        Ok(bank)
    }

    /// True if every byte from `offset` to the end of the bank is 0xFF.
    fn is_erased_from(&mut self, bank: Bank, offset: u32) -> Result<bool, Error> {
        let size = self.hal.size();
        let mut offset = offset;
        let mut buffer = [0u8; ERASED_CHECK_CHUNK];

        while offset < size {
            let chunk = cmp::min(ERASED_CHECK_CHUNK as u32, size - offset);
            let buffer = &mut buffer[..chunk as usize];
            self.read(bank, offset, buffer)?;
            if buffer.iter().any(|&b| b != 0xFF) {
                #[cfg(feature = "defmt")]
                trace!("bank {} not erased at {:#x}", bank, offset);

                #[cfg(feature = "debug-logs")]
                println!("  internal: bank {bank} not erased at {offset:#x}");

                return Ok(false);
            }
            offset += chunk;
        }

        Ok(true)
    }

    /// Erases a bank unless it is erased already, which saves an erase cycle.
    fn erase_bank(&mut self, bank: Bank) -> Result<(), Error> {
        if self.is_erased_from(bank, 0)? {
            #[cfg(feature = "defmt")]
            trace!("bank {} already erased", bank);

            return Ok(());
        }

        #[cfg(feature = "defmt")]
        info!("erase bank {}", bank);

        #[cfg(feature = "debug-logs")]
        println!("  internal: erase bank {bank}");

        self.hal.erase(bank).map_err(|_| Error::FlashError)
    }

    fn copy(&mut self, from: Bank, source: u32, to: Bank, target: u32, len: u32) -> Result<(), Error> {
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        let mut done = 0;
        while done < len {
            let chunk = cmp::min(COPY_BUFFER_SIZE as u32, len - done);
            let buffer = &mut buffer[..chunk as usize];
            self.read(from, source + done, buffer)?;
            self.write(to, target + done, buffer)?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies all live entries into the other bank and makes it the current one.
    ///
    /// The old bank stays untouched. Until the header of the new bank is written, the old bank
    /// is still the latest one after a reset.
    pub(crate) fn migrate(&mut self) -> Result<(), Error> {
        let current_bank = self.current_bank;
        let next_bank = current_bank.other();

        #[cfg(feature = "defmt")]
        info!("migrate bank {} -> bank {}", current_bank, next_bank);

        #[cfg(feature = "debug-logs")]
        println!("  internal: migrate bank {current_bank} -> bank {next_bank}");

        self.erase_bank(next_bank)?;
        let mut next_write_offset = self.hal.align_ceil(BANK_HEADER_LEN);

        let mut it = EntryIterator::new(&mut self.hal, current_bank)?;
        while it.has_next() {
            if it.tag != TAG_DELETED {
                let stride = it.stride(&self.hal);

                #[cfg(feature = "defmt")]
                trace!(
                    "migrate {:#x} len {} @{:#x} -> @{:#x}",
                    it.tag, it.len, it.offset, next_write_offset
                );

                self.copy(current_bank, it.offset, next_bank, next_write_offset, stride)?;
                next_write_offset += stride;
            }
            it.advance(&mut self.hal)?;
        }

        let epoch = self
            .read_header(current_bank)?
            .map_or(Epoch::ZERO, |header| header.epoch);
        self.write_header(next_bank, epoch.next())?;

        self.current_bank = next_bank;
        self.write_offset = next_write_offset;
        Ok(())
    }

    /// Invalidates all entries of `tag` that start before `offset`.
    pub(crate) fn delete_tag_until_offset(&mut self, tag: u32, offset: u32) -> Result<(), Error> {
        let mut it = EntryIterator::new(&mut self.hal, self.current_bank)?;
        while it.has_next() && it.offset < offset {
            if it.tag == tag {
                #[cfg(feature = "defmt")]
                trace!("invalidate {:#x} @{:#x}", tag, it.offset);

                #[cfg(feature = "debug-logs")]
                println!("  internal: invalidate {tag:#x} @{:#x}", it.offset);

                self.invalidate(&it)?;
            }
            it.advance(&mut self.hal)?;
        }
        Ok(())
    }

    /// Zeroes the tag of an entry. If the tag can't be written on its own, the whole entry is
    /// zeroed instead, which reads back as a sequence of `{ tag: 0, len: 0 }` entries.
    ///
    /// The entry is zeroed back to front and the block holding the descriptor goes last, so
    /// an interrupted invalidation still leaves a walkable log: the descriptor keeps its
    /// length and only the value tail is zeroed. After a reset in `store_tag` the duplicate
    /// cleanup on startup finishes the job. An interrupted `delete_tag` leaves the tag alive
    /// with a partly zeroed value.
    fn invalidate(&mut self, it: &EntryIterator) -> Result<(), Error> {
        let alignment = self.hal.alignment();
        if alignment <= MAX_TAG_ONLY_ALIGNMENT {
            return self.write(it.bank, it.offset, &TAG_DELETED.to_be_bytes());
        }

        let zeros = [0u8; COPY_BUFFER_SIZE];
        let mut end = it.stride(&self.hal);
        while end > alignment {
            let chunk = cmp::min(COPY_BUFFER_SIZE as u32, end - alignment);
            end -= chunk;
            self.write(it.bank, it.offset + end, &zeros[..chunk as usize])?;
        }
        self.write(it.bank, it.offset, &zeros[..alignment as usize])
    }

    /// Selects the current bank and places the write offset, repairing whatever a reset in the
    /// middle of an operation left behind.
    pub(crate) fn recover(&mut self) -> Result<(), Error> {
        match self.latest_bank()? {
            Some(bank) => {
                #[cfg(feature = "defmt")]
                info!("found bank {}", bank);

                #[cfg(feature = "debug-logs")]
                println!("FlashTlv: found bank {bank}");

                self.current_bank = bank;
                self.resume()?;
            }
            None => {
                #[cfg(feature = "defmt")]
                warn!("no valid bank found, formatting");

                #[cfg(feature = "debug-logs")]
                println!("FlashTlv: no valid bank found, formatting");

                self.format()?;
            }
        }

        #[cfg(feature = "defmt")]
        info!("write offset {:#x}", self.write_offset);

        #[cfg(feature = "debug-logs")]
        println!("FlashTlv: write offset {:#x}", self.write_offset);

        Ok(())
    }

    fn resume(&mut self) -> Result<(), Error> {
        let mut last = None;
        let mut it = EntryIterator::new(&mut self.hal, self.current_bank)?;
        while it.has_next() {
            last = Some((it.tag, it.offset));
            it.advance(&mut self.hal)?;
        }
        self.write_offset = it.offset;

        // reset after the new entry was written but before older copies were invalidated
        if let Some((tag, offset)) = last {
            if tag != TAG_DELETED {
                self.delete_tag_until_offset(tag, offset)?;
            }
        }

        // reset after the value was written but before its descriptor
        if self.is_erased_from(self.current_bank, self.write_offset)? {
            #[cfg(feature = "defmt")]
            trace!("flash clean after last entry");
        } else {
            #[cfg(feature = "defmt")]
            warn!("flash not empty after last entry, migrate");

            #[cfg(feature = "debug-logs")]
            println!("FlashTlv: flash not empty after last entry, migrate");

            self.migrate()?;
        }

        Ok(())
    }

    /// Erases both banks and starts over with an empty bank 0.
    fn format(&mut self) -> Result<(), Error> {
        self.erase_bank(Bank::Zero)?;
        self.erase_bank(Bank::One)?;
        self.write_header(Bank::Zero, Epoch::ZERO)?;

        self.current_bank = Bank::Zero;
        self.write_offset = self.hal.align_ceil(BANK_HEADER_LEN);
        Ok(())
    }
}
