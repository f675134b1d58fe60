//! The memory-mapped I/O register block.
//!
//! This is the raw 16-bit backing store for slot 4 plus the register
//! offsets the core decodes itself (wait control, DMA programming,
//! interrupt control). The bus intercepts accesses to this slot and routes
//! the interesting offsets to their owners; everything else lands in the
//! raw block or is logged as a stub.

use serde::{Deserialize, Serialize};

/// Bytes of I/O space backed by the raw block.
pub const IO_SIZE: usize = 0x400;

pub const IO_DISPCNT: u32 = 0x000;
pub const IO_DISPSTAT: u32 = 0x004;
pub const IO_VCOUNT: u32 = 0x006;

pub const IO_SOUND_FIFO_A: u32 = 0x0A0;
pub const IO_SOUND_FIFO_B: u32 = 0x0A4;

/// Base of the DMA register banks; each channel occupies 12 bytes.
pub const IO_DMA_BASE: u32 = 0x0B0;
pub const IO_DMA_BANK_LEN: u32 = 0x00C;
pub const IO_DMA_END: u32 = 0x0E0;

pub const IO_IE: u32 = 0x200;
pub const IO_IF: u32 = 0x202;
pub const IO_WAITCNT: u32 = 0x204;
pub const IO_IME: u32 = 0x208;
pub const IO_POSTFLG: u32 = 0x300;
pub const IO_HALTCNT: u32 = 0x301;

/// Byte offset of a channel's control halfword inside the block.
#[must_use]
pub const fn dma_control_offset(channel: usize) -> u32 {
    IO_DMA_BASE + IO_DMA_BANK_LEN * channel as u32 + 0xA
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoRegisters {
    registers: Vec<u16>,
}

impl Default for IoRegisters {
    fn default() -> Self {
        Self {
            registers: vec![0; IO_SIZE / 2],
        }
    }
}

impl IoRegisters {
    /// Raw halfword at the given byte offset.
    #[must_use]
    pub fn value(&self, offset: u32) -> u16 {
        self.registers[(offset as usize % IO_SIZE) >> 1]
    }

    pub fn set_value(&mut self, offset: u32, value: u16) {
        self.registers[(offset as usize % IO_SIZE) >> 1] = value;
    }

    /// Byte-lane write merged into the backing halfword.
    pub fn set_byte(&mut self, offset: u32, value: u8) {
        let current = self.value(offset & !1);
        let merged = if offset & 1 == 0 {
            (current & 0xFF00) | u16::from(value)
        } else {
            (current & 0x00FF) | u16::from(value) << 8
        };
        self.set_value(offset & !1, merged);
    }

    /// The whole block as little-endian bytes, for snapshots.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.registers
            .iter()
            .flat_map(|half| half.to_le_bytes())
            .collect()
    }

    /// Restores the block from a snapshot produced by [`Self::to_bytes`].
    pub fn restore_bytes(&mut self, bytes: &[u8]) {
        for (half, chunk) in self.registers.iter_mut().zip(bytes.chunks_exact(2)) {
            *half = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
    }
}
