//! Flash backup memory with the Atmel/Sanyo command protocol GBA titles use.
//!
//! Commands arrive as magic byte sequences written to `0x5555` and `0x2AAA`:
//! `AA` at `0x5555`, `55` at `0x2AAA`, then a command byte at `0x5555`.
//! Erase commands (`80`) require a second unlock cycle before the erase type
//! byte. Programming a byte can only clear bits; only an erase sets them.

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SIZE_FLASH_512: usize = 0x0001_0000;
pub const SIZE_FLASH_1M: usize = 0x0002_0000;

const SECTOR_SIZE: usize = 0x1000;
const BANK_SIZE: usize = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashSize {
    /// 512 Kbit part (64 KiB), single bank.
    Flash512,
    /// 1 Mbit part (128 KiB), two banks behind the `B0` bank-select command.
    Flash1M,
}

impl FlashSize {
    const fn byte_len(self) -> usize {
        match self {
            Self::Flash512 => SIZE_FLASH_512,
            Self::Flash1M => SIZE_FLASH_1M,
        }
    }

    /// Manufacturer and device IDs returned in ID mode, matching the parts
    /// commercial carts shipped with (Panasonic for 64 KiB, Sanyo for
    /// 128 KiB).
    const fn id(self) -> [u8; 2] {
        match self {
            Self::Flash512 => [0x32, 0x1B],
            Self::Flash1M => [0x62, 0x13],
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FlashState {
    #[default]
    Ready,
    /// Received `AA` at `0x5555`.
    Unlock1,
    /// Received `55` at `0x2AAA`; the next write is the command byte.
    Unlock2,
    /// Received the `80` erase prefix; a second unlock cycle follows.
    Erase,
    EraseUnlock1,
    /// Second unlock done; the next write selects chip or sector erase.
    EraseUnlock2,
    /// Received `A0`; the next write programs a single byte.
    ByteWrite,
    /// Received `B0` (1 Mbit part); the next write to `0x0000` picks a bank.
    BankSelect,
    /// Received `90`; reads of offsets 0/1 return the chip IDs until `F0`.
    IdMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Flash {
    data: Vec<u8>,
    size: FlashSize,
    bank: usize,
    state: FlashState,
    pub write_pending: bool,
}

impl Flash {
    #[must_use]
    pub fn new(size: FlashSize) -> Self {
        Self {
            // Erased flash reads back all ones.
            data: vec![0xFF; size.byte_len()],
            size,
            bank: 0,
            state: FlashState::Ready,
            write_pending: false,
        }
    }

    fn bank_base(&self) -> usize {
        self.bank * BANK_SIZE
    }

    pub fn load8(&self, offset: u32) -> u8 {
        let offset = (offset as usize) & (BANK_SIZE - 1);

        if self.state == FlashState::IdMode {
            return match offset {
                0 | 1 => self.size.id()[offset],
                _ => 0xFF,
            };
        }

        self.data[self.bank_base() + offset]
    }

    pub fn load16(&self, offset: u32) -> u16 {
        u16::from_le_bytes([self.load8(offset), self.load8(offset.wrapping_add(1))])
    }

    pub fn load32(&self, offset: u32) -> u32 {
        u32::from(self.load16(offset)) | u32::from(self.load16(offset.wrapping_add(2))) << 16
    }

    pub fn store8(&mut self, offset: u32, value: u8) {
        let offset = (offset as usize) & (BANK_SIZE - 1);

        self.state = match self.state {
            FlashState::Ready => match (offset, value) {
                (0x5555, 0xAA) => FlashState::Unlock1,
                _ => FlashState::Ready,
            },
            FlashState::Unlock1 => match (offset, value) {
                (0x2AAA, 0x55) => FlashState::Unlock2,
                _ => FlashState::Ready,
            },
            FlashState::Unlock2 => self.command(offset, value),
            FlashState::Erase => match (offset, value) {
                (0x5555, 0xAA) => FlashState::EraseUnlock1,
                _ => FlashState::Ready,
            },
            FlashState::EraseUnlock1 => match (offset, value) {
                (0x2AAA, 0x55) => FlashState::EraseUnlock2,
                _ => FlashState::Ready,
            },
            FlashState::EraseUnlock2 => {
                match (offset, value) {
                    (0x5555, 0x10) => self.erase_chip(),
                    (sector, 0x30) => self.erase_sector(sector),
                    _ => debug!("flash: unknown erase type {value:#04X}"),
                }
                FlashState::Ready
            }
            FlashState::ByteWrite => {
                let index = self.bank_base() + offset;
                // Programming can only clear bits.
                self.data[index] &= value;
                self.write_pending = true;
                FlashState::Ready
            }
            FlashState::BankSelect => {
                if offset == 0x0000 {
                    self.bank = (value & 1) as usize;
                    debug!("flash: bank {}", self.bank);
                }
                FlashState::Ready
            }
            FlashState::IdMode => match (offset, value) {
                (_, 0xF0) => FlashState::Ready,
                (0x5555, 0xAA) => FlashState::Unlock1,
                _ => FlashState::IdMode,
            },
        };
    }

    fn command(&mut self, offset: usize, value: u8) -> FlashState {
        if offset != 0x5555 {
            return FlashState::Ready;
        }
        match value {
            0x80 => FlashState::Erase,
            0xA0 => FlashState::ByteWrite,
            0x90 => FlashState::IdMode,
            0xF0 => FlashState::Ready,
            0xB0 if self.size == FlashSize::Flash1M => FlashState::BankSelect,
            _ => {
                debug!("flash: unknown command {value:#04X}");
                FlashState::Ready
            }
        }
    }

    fn erase_chip(&mut self) {
        debug!("flash: chip erase");
        self.data.fill(0xFF);
        self.write_pending = true;
    }

    fn erase_sector(&mut self, offset: usize) {
        let base = self.bank_base() + (offset & !(SECTOR_SIZE - 1));
        debug!("flash: sector erase at {base:#07X}");
        self.data[base..base + SECTOR_SIZE].fill(0xFF);
        self.write_pending = true;
    }

    pub fn replace_data(&mut self, data: &[u8]) {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.write_pending = false;
    }

    #[must_use]
    pub fn view(&self) -> &[u8] {
        &self.data
    }
}
