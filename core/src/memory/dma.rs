//! DMA channel state and control-register decoding.
//!
//! Four channels, each programmed through a source/destination pair, a word
//! count and a control halfword. The visible registers never change once
//! programmed; the `next_*` shadow fields describe the remaining work and
//! advance as the engine services the channel. Scheduling and the transfer
//! loop live on the bus, which owns the regions the channels move data
//! between.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Per-access address step multiplier, indexed by the address-control field.
pub const DMA_OFFSET: [i32; 4] = [1, -1, 0, 1];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressControl {
    #[default]
    Increment,
    Decrement,
    Fixed,
    /// Increments while transferring, reloads the written base on repeat.
    /// Destination only.
    IncrementReload,
}

impl AddressControl {
    fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => Self::Increment,
            1 => Self::Decrement,
            2 => Self::Fixed,
            _ => Self::IncrementReload,
        }
    }

    #[must_use]
    pub const fn offset(self) -> i32 {
        DMA_OFFSET[self as usize]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmaTiming {
    #[default]
    Immediate,
    VBlank,
    HBlank,
    /// Channel-specific: audio FIFO on 1-2, video capture on 3.
    Custom,
}

impl DmaTiming {
    fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => Self::Immediate,
            1 => Self::VBlank,
            2 => Self::HBlank,
            _ => Self::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DmaChannel {
    pub enable: bool,
    pub repeat: bool,
    /// Transfer width in bytes: 2 or 4.
    pub width: u32,
    pub do_irq: bool,
    pub src_control: AddressControl,
    pub dst_control: AddressControl,
    pub timing: DmaTiming,

    pub source: u32,
    pub dest: u32,
    pub count: u32,

    pub next_source: u32,
    pub next_dest: u32,
    pub next_count: u32,
    /// Cycle stamp at which the completion interrupt fires.
    pub next_irq: Option<u64>,
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self {
            enable: false,
            repeat: false,
            width: 2,
            do_irq: false,
            src_control: AddressControl::default(),
            dst_control: AddressControl::default(),
            timing: DmaTiming::default(),
            source: 0,
            dest: 0,
            count: 0,
            next_source: 0,
            next_dest: 0,
            next_count: 0,
            next_irq: None,
        }
    }
}

impl DmaChannel {
    /// Decodes a control-halfword write. Returns `true` on the leading edge
    /// of the enable bit, when the caller must latch the shadow registers
    /// and schedule the channel.
    pub fn write_control(&mut self, half: u16) -> bool {
        let was_enabled = self.enable;

        self.dst_control = AddressControl::from_bits(half.get_bits(5..=6));
        self.src_control = AddressControl::from_bits(half.get_bits(7..=8));
        self.repeat = half.get_bit(9);
        self.width = if half.get_bit(10) { 4 } else { 2 };
        self.timing = DmaTiming::from_bits(half.get_bits(12..=13));
        self.do_irq = half.get_bit(14);
        self.enable = half.get_bit(15);

        if self.enable && !was_enabled {
            self.next_source = self.source;
            self.next_dest = self.dest;
            self.next_count = self.count;
            return true;
        }
        false
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dma {
    pub channels: [DmaChannel; 4],
}

impl Dma {
    /// A word count of zero means the channel maximum.
    const fn max_count(channel: usize) -> u32 {
        if channel == 3 {
            0x10000
        } else {
            0x4000
        }
    }

    pub fn set_source_address(&mut self, channel: usize, address: u32) {
        self.channels[channel].source = address & 0x0FFF_FFFF;
    }

    pub fn set_dest_address(&mut self, channel: usize, address: u32) {
        self.channels[channel].dest = address & 0x0FFF_FFFF;
    }

    pub fn set_word_count(&mut self, channel: usize, half: u16) {
        self.channels[channel].count = if half == 0 {
            Self::max_count(channel)
        } else {
            u32::from(half)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_decode() {
        let mut channel = DmaChannel::default();

        // dest decrement, src fixed, repeat, 32-bit, hblank, irq, enable
        let edge = channel.write_control(0b1110_0111_0010_0000);

        assert!(edge);
        assert!(channel.enable);
        assert!(channel.repeat);
        assert!(channel.do_irq);
        assert_eq!(channel.width, 4);
        assert_eq!(channel.dst_control, AddressControl::Decrement);
        assert_eq!(channel.src_control, AddressControl::Fixed);
        assert_eq!(channel.timing, DmaTiming::HBlank);
    }

    #[test]
    fn test_enable_edge_latches_shadows() {
        let mut dma = Dma::default();
        dma.set_source_address(0, 0x0200_0000);
        dma.set_dest_address(0, 0x0300_0000);
        dma.set_word_count(0, 0x20);

        let edge = dma.channels[0].write_control(0x8000);
        assert!(edge);
        assert_eq!(dma.channels[0].next_source, 0x0200_0000);
        assert_eq!(dma.channels[0].next_dest, 0x0300_0000);
        assert_eq!(dma.channels[0].next_count, 0x20);

        // Rewriting control while enabled is not a fresh edge.
        assert!(!dma.channels[0].write_control(0x8000));
    }

    #[test]
    fn test_addresses_masked_to_bus_width() {
        let mut dma = Dma::default();

        dma.set_source_address(1, 0xFFFF_FFFF);
        assert_eq!(dma.channels[1].source, 0x0FFF_FFFF);
    }

    #[test]
    fn test_zero_count_means_max() {
        let mut dma = Dma::default();

        dma.set_word_count(0, 0);
        dma.set_word_count(3, 0);

        assert_eq!(dma.channels[0].count, 0x4000);
        assert_eq!(dma.channels[3].count, 0x10000);
    }

    #[test]
    fn test_state_serializes_for_savestates() {
        let mut dma = Dma::default();
        dma.set_source_address(3, 0x0800_0000);
        dma.channels[3].write_control(0x8400);

        let bytes = bincode::serialize(&dma).unwrap();
        let restored: Dma = bincode::deserialize(&bytes).unwrap();

        assert_eq!(restored.channels[3].source, 0x0800_0000);
        assert!(restored.channels[3].enable);
        assert_eq!(restored.channels[3].width, 4);
    }

    #[test]
    fn test_offset_table() {
        assert_eq!(AddressControl::Increment.offset(), 1);
        assert_eq!(AddressControl::Decrement.offset(), -1);
        assert_eq!(AddressControl::Fixed.offset(), 0);
        assert_eq!(AddressControl::IncrementReload.offset(), 1);
    }
}
