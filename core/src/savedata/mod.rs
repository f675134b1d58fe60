//! Cartridge backup memory: battery SRAM, Flash and EEPROM.
//!
//! All three variants sit behind [`Backup`] with a uniform access surface,
//! a `write_pending` dirty bit the frame-boundary flush observes, and a raw
//! `view` for dumping the save file. At most one backup is live at a time:
//! SRAM and Flash occupy the backup slot at `0x0E00_0000`, EEPROM the high
//! half of cartridge window 2.

mod eeprom;
mod flash;
mod sram;

pub use eeprom::Eeprom;
pub use flash::{Flash, FlashSize};
pub use sram::Sram;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub enum Backup {
    Sram(Sram),
    Flash(Flash),
    Eeprom(Eeprom),
}

impl Backup {
    /// Loads take `&mut self`: EEPROM reads consume one bit of the serial
    /// stream per access.
    pub fn load_u8(&mut self, offset: u32) -> u8 {
        match self {
            Self::Sram(sram) => sram.load8(offset),
            Self::Flash(flash) => flash.load8(offset),
            Self::Eeprom(eeprom) => eeprom.read_bit() as u8,
        }
    }

    pub fn load8(&mut self, offset: u32) -> i8 {
        self.load_u8(offset) as i8
    }

    pub fn load_u16(&mut self, offset: u32) -> u16 {
        match self {
            Self::Sram(sram) => sram.load16(offset),
            Self::Flash(flash) => flash.load16(offset),
            Self::Eeprom(eeprom) => eeprom.read_bit(),
        }
    }

    pub fn load16(&mut self, offset: u32) -> i16 {
        self.load_u16(offset) as i16
    }

    pub fn load32(&mut self, offset: u32) -> u32 {
        match self {
            Self::Sram(sram) => sram.load32(offset),
            Self::Flash(flash) => flash.load32(offset),
            Self::Eeprom(eeprom) => u32::from(eeprom.read_bit()),
        }
    }

    pub fn store8(&mut self, offset: u32, value: u8) {
        match self {
            Self::Sram(sram) => sram.store8(offset, value),
            Self::Flash(flash) => flash.store8(offset, value),
            Self::Eeprom(eeprom) => eeprom.write_bit(value & 1 != 0),
        }
    }

    pub fn store16(&mut self, offset: u32, value: u16) {
        match self {
            Self::Sram(sram) => sram.store16(offset, value),
            Self::Flash(flash) => flash.store8(offset, value as u8),
            Self::Eeprom(eeprom) => eeprom.write_bit(value & 1 != 0),
        }
    }

    pub fn store32(&mut self, offset: u32, value: u32) {
        match self {
            Self::Sram(sram) => sram.store32(offset, value),
            Self::Flash(flash) => flash.store8(offset, value as u8),
            Self::Eeprom(eeprom) => eeprom.write_bit(value & 1 != 0),
        }
    }

    /// Replaces the backing bytes with a previously saved image.
    pub fn replace_data(&mut self, data: &[u8]) {
        match self {
            Self::Sram(sram) => sram.replace_data(data),
            Self::Flash(flash) => flash.replace_data(data),
            Self::Eeprom(eeprom) => eeprom.replace_data(data),
        }
    }

    #[must_use]
    pub fn write_pending(&self) -> bool {
        match self {
            Self::Sram(sram) => sram.write_pending,
            Self::Flash(flash) => flash.write_pending,
            Self::Eeprom(eeprom) => eeprom.write_pending,
        }
    }

    pub fn clear_write_pending(&mut self) {
        match self {
            Self::Sram(sram) => sram.write_pending = false,
            Self::Flash(flash) => flash.write_pending = false,
            Self::Eeprom(eeprom) => eeprom.write_pending = false,
        }
    }

    /// Raw dump of the save contents, the bytes that go into a save file.
    #[must_use]
    pub fn view(&self) -> &[u8] {
        match self {
            Self::Sram(sram) => sram.view(),
            Self::Flash(flash) => flash.view(),
            Self::Eeprom(eeprom) => eeprom.view(),
        }
    }

    #[must_use]
    pub const fn is_eeprom(&self) -> bool {
        matches!(self, Self::Eeprom(_))
    }
}
