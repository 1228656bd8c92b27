//! The `Get<T>` trait and its implementation in this module allows providing a single generic,
//! overloaded function `get<T>()` for owned values. Unlike `get_tag`, these report a missing
//! tag as [`Error::TagNotFound`] so an empty value can be told apart from a missing one.

use crate::error::Error;
use crate::platform::FlashBank;
use crate::{FlashTlv, Tag};
use alloc::vec;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, tag: Tag) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, tag: Tag) -> Result<T, Error> {
        (*self).get(tag)
    }
}

impl<T: FlashBank> Get<Vec<u8>> for FlashTlv<T> {
    fn get(&mut self, tag: Tag) -> Result<Vec<u8>, Error> {
        let (value_offset, len) = self.find(tag)?.ok_or(Error::TagNotFound)?;
        let mut buf = vec![0u8; len as usize];
        self.read(self.current_bank, value_offset, &mut buf)?;
        Ok(buf)
    }
}

/// Fixed size values like keys, fails with [`Error::LengthMismatch`] if the stored value is
/// shorter or longer than `N`.
impl<T: FlashBank, const N: usize> Get<[u8; N]> for FlashTlv<T> {
    fn get(&mut self, tag: Tag) -> Result<[u8; N], Error> {
        let (value_offset, len) = self.find(tag)?.ok_or(Error::TagNotFound)?;
        if len as usize != N {
            return Err(Error::LengthMismatch(len as usize));
        }
        let mut buf = [0u8; N];
        self.read(self.current_bank, value_offset, &mut buf)?;
        Ok(buf)
    }
}
