#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use btstack_tlv::FlashTlv;
use btstack_tlv::platform::NorFlashBanks;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// Small sectors keep the banks small enough to fill them up in a test.
pub const FLASH_SECTOR_SIZE: usize = 128;
pub const WORD_SIZE: usize = 4;
pub const BANK_SIZE: u32 = FLASH_SECTOR_SIZE as u32;
pub const BANK_HEADER_SIZE: u32 = 8;
pub const ENTRY_HEADER_SIZE: u32 = 8;

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    /// Writes and erases that still succeed before the injected fault, `None` disables it.
    pub writes_until_fault: Option<usize>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(sectors: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            ..Default::default()
        }
    }

    /// Lets the next `writes` writes or erases pass and fails the one after, like a reset in
    /// the middle of an operation. The flash works again afterwards.
    pub fn fail_after_writes(&mut self, writes: usize) {
        self.writes_until_fault = Some(writes);
    }

    pub fn disable_faults(&mut self) {
        self.writes_until_fault = None;
    }

    pub fn bank(&self, bank: usize) -> &[u8] {
        &self.buf[bank * FLASH_SECTOR_SIZE..(bank + 1) * FLASH_SECTOR_SIZE]
    }

    pub fn bank_mut(&mut self, bank: usize) -> &mut [u8] {
        &mut self.buf[bank * FLASH_SECTOR_SIZE..(bank + 1) * FLASH_SECTOR_SIZE]
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

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn consume_write(&mut self) -> Result<(), FlashError> {
        match self.writes_until_fault {
            Some(0) => {
                println!("    flash: FAULT");
                self.writes_until_fault = None;
                Err(FlashError)
            }
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Opens a store on both sectors of `flash`, like a reboot of the device.
pub fn open(flash: &mut Flash) -> FlashTlv<NorFlashBanks<&mut Flash>> {
    let banks = NorFlashBanks::new(flash, 0, BANK_SIZE).unwrap();
    FlashTlv::new(banks).unwrap()
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
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

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

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );
        self.consume_write()?;

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        self.consume_write()?;

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}
