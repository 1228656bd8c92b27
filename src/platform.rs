use crate::error::Error;
use crate::raw::{BANK_HEADER_LEN, ENTRY_HEADER_LEN, MAX_ALIGNMENT};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::ops::Range;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

pub use crate::raw::Bank;

/// A flash device split into two equally sized banks.
///
/// `erase` sets every byte of the bank to 0xFF. `write` may only clear bits and is only
/// called with offsets and lengths that are multiples of [`alignment`](FlashBank::alignment).
/// See [`NorFlashBanks`] for an implementation on top of any `embedded-storage` NOR flash.
pub trait FlashBank {
    type Error: Debug;

    /// Size of a single bank in bytes.
    fn size(&self) -> u32;

    /// Read and write granularity in bytes, a power of two.
    fn alignment(&self) -> u32;

    fn erase(&mut self, bank: Bank) -> Result<(), Self::Error>;

    fn read(&mut self, bank: Bank, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;

    fn write(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), Self::Error>;
}

impl<T: FlashBank> FlashBank for &mut T {
    type Error = T::Error;

    fn size(&self) -> u32 {
        T::size(self)
    }

    fn alignment(&self) -> u32 {
        T::alignment(self)
    }

    fn erase(&mut self, bank: Bank) -> Result<(), Self::Error> {
        T::erase(self, bank)
    }

    fn read(&mut self, bank: Bank, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        T::read(self, bank, offset, bytes)
    }

    fn write(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        T::write(self, bank, offset, bytes)
    }
}

pub trait AlignedOps: FlashBank {
    fn align_ceil(&self, size: u32) -> u32 {
        align_ceil(size as usize, self.alignment() as usize) as u32
    }

    fn is_aligned(&self, size: usize) -> bool {
        size.is_multiple_of(self.alignment() as usize)
    }
}

impl<T: FlashBank> AlignedOps for T {}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    size.saturating_add(alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub(crate) const fn align_floor(size: usize, alignment: usize) -> usize {
    size & !(alignment - 1)
}

/// Rejects geometries the store can't work with.
pub(crate) fn check_geometry<T: FlashBank>(hal: &T) -> Result<(), Error> {
    let alignment = hal.alignment();
    if !alignment.is_power_of_two() || alignment as usize > MAX_ALIGNMENT {
        return Err(Error::UnsupportedAlignment);
    }

    let size = hal.size();
    let minimum = hal.align_ceil(BANK_HEADER_LEN) + hal.align_ceil(ENTRY_HEADER_LEN);
    if !size.is_multiple_of(alignment) || size < minimum {
        return Err(Error::InvalidBankSize);
    }

    Ok(())
}

/// Two consecutive banks inside a NOR flash partition.
///
/// ```text
/// partition_offset
/// v
/// | bank 0 (bank_size) | bank 1 (bank_size) |
/// ```
pub struct NorFlashBanks<F> {
    flash: F,
    partition_offset: u32,
    bank_size: u32,
}

impl<F: NorFlash> NorFlashBanks<F> {
    /// Both the partition offset and the bank size have to be multiples of the erase size.
    pub fn new(flash: F, partition_offset: u32, bank_size: u32) -> Result<Self, Error> {
        if !(partition_offset as usize).is_multiple_of(F::ERASE_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if bank_size == 0 || !(bank_size as usize).is_multiple_of(F::ERASE_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }

        let end = (partition_offset as usize).saturating_add(2 * bank_size as usize);
        if end > flash.capacity() {
            return Err(Error::InvalidPartitionSize);
        }

        Ok(Self {
            flash,
            partition_offset,
            bank_size,
        })
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn address(&self, bank: Bank, offset: u32) -> u32 {
        self.partition_offset + bank.index() as u32 * self.bank_size + offset
    }
}

impl<F: NorFlash> FlashBank for NorFlashBanks<F> {
    type Error = F::Error;

    fn size(&self) -> u32 {
        self.bank_size
    }

    fn alignment(&self) -> u32 {
        F::READ_SIZE.max(F::WRITE_SIZE) as u32
    }

    fn erase(&mut self, bank: Bank) -> Result<(), Self::Error> {
        let from = self.address(bank, 0);
        self.flash.erase(from, from + self.bank_size)
    }

    fn read(&mut self, bank: Bank, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.address(bank, offset);
        self.flash.read(address, bytes)
    }

    fn write(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = self.address(bank, offset);
        self.flash.write(address, bytes)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryFlashError {
    OutOfBounds,
    NotAligned,
}

/// RAM backed flash with two banks. Writes behave like NOR flash and can only clear bits.
pub struct MemoryFlashBank {
    storage: Vec<u8>,
    bank_size: u32,
    alignment: u32,
}

impl MemoryFlashBank {
    /// Creates two erased banks of `bank_size` bytes each.
    pub fn new(bank_size: u32, alignment: u32) -> Self {
        Self {
            storage: vec![0xFF; 2 * bank_size as usize],
            bank_size,
            alignment,
        }
    }

    pub fn bank(&self, bank: Bank) -> &[u8] {
        let start = bank.index() * self.bank_size as usize;
        &self.storage[start..start + self.bank_size as usize]
    }

    /// Raw access, e.g. to inject corruption.
    pub fn bank_mut(&mut self, bank: Bank) -> &mut [u8] {
        let start = bank.index() * self.bank_size as usize;
        &mut self.storage[start..start + self.bank_size as usize]
    }

    fn range(&self, bank: Bank, offset: u32, len: usize) -> Result<Range<usize>, MemoryFlashError> {
        let alignment = self.alignment as usize;
        if !(offset as usize).is_multiple_of(alignment) || !len.is_multiple_of(alignment) {
            return Err(MemoryFlashError::NotAligned);
        }

        let end = (offset as usize)
            .checked_add(len)
            .ok_or(MemoryFlashError::OutOfBounds)?;
        if end > self.bank_size as usize {
            return Err(MemoryFlashError::OutOfBounds);
        }

        let base = bank.index() * self.bank_size as usize;
        Ok(base + offset as usize..base + end)
    }
}

impl FlashBank for MemoryFlashBank {
    type Error = MemoryFlashError;

    fn size(&self) -> u32 {
        self.bank_size
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }

    fn erase(&mut self, bank: Bank) -> Result<(), Self::Error> {
        self.bank_mut(bank).fill(0xFF);
        Ok(())
    }

    fn read(&mut self, bank: Bank, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(bank, offset, bytes.len())?;
        bytes.copy_from_slice(&self.storage[range]);
        Ok(())
    }

    fn write(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(bank, offset, bytes.len())?;
        for (cell, &val) in self.storage[range].iter_mut().zip(bytes) {
            *cell &= val;
        }
        Ok(())
    }
}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use crate::platform::NorFlashBanks;
    use esp_storage::FlashStorage;

    /// Two banks inside the internal SPI flash of an ESP32 chip.
    pub type EspFlashBanks<'d> = NorFlashBanks<FlashStorage<'d>>;
}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
pub use chip::*;
