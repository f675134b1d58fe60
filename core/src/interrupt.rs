//! Interrupt control: the IE/IF/IME registers, the halt state and the
//! delivery of DMA completion interrupts.
//!
//! The full interrupt controller (timers, keypad, serial) belongs to the
//! host; the core owns the registers because they live in its I/O block and
//! because the DMA engine queues completion interrupts against the cycle
//! counter.

use serde::{Deserialize, Serialize};

use crate::memory::dma::Dma;

/// Interrupt request lines, by bit index in IE/IF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Irq {
    VBlank = 0,
    HBlank = 1,
    VCount = 2,
    Timer0 = 3,
    Timer1 = 4,
    Timer2 = 5,
    Timer3 = 6,
    Serial = 7,
    Dma0 = 8,
    Dma1 = 9,
    Dma2 = 10,
    Dma3 = 11,
    Keypad = 12,
    GamePak = 13,
}

impl Irq {
    #[must_use]
    pub const fn dma(channel: usize) -> Self {
        match channel {
            0 => Self::Dma0,
            1 => Self::Dma1,
            2 => Self::Dma2,
            _ => Self::Dma3,
        }
    }

    #[must_use]
    pub const fn mask(self) -> u16 {
        1 << self as u16
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InterruptControl {
    /// IE: enabled request lines.
    pub enable: u16,
    /// IF: raised request lines, acknowledged by writing ones.
    pub flags: u16,
    /// IME: master enable.
    pub master_enable: bool,
    /// Set by a HALTCNT write; cleared when an enabled line fires.
    pub halted: bool,
    /// POSTFLG: set by the BIOS once boot finished.
    pub post_boot_flag: u8,
}

impl InterruptControl {
    pub fn raise(&mut self, irq: Irq) {
        self.flags |= irq.mask();
        if self.enable & irq.mask() != 0 {
            self.halted = false;
        }
    }

    /// IF writes acknowledge: every written one clears that line.
    pub fn acknowledge(&mut self, mask: u16) {
        self.flags &= !mask;
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// True when an enabled request should reach the CPU.
    #[must_use]
    pub const fn irq_pending(&self) -> bool {
        self.master_enable && self.enable & self.flags != 0
    }

    /// Delivers DMA completion interrupts whose stamp has been reached.
    /// Called by the host on every step with the current cycle count.
    pub fn poll_dma(&mut self, cycles: u64, dma: &mut Dma) {
        for (channel, state) in dma.channels.iter_mut().enumerate() {
            if let Some(stamp) = state.next_irq {
                if stamp <= cycles {
                    state.next_irq = None;
                    self.raise(Irq::dma(channel));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_clears_written_bits() {
        let mut irq = InterruptControl::default();
        irq.raise(Irq::Dma1);
        irq.raise(Irq::VBlank);

        irq.acknowledge(Irq::Dma1.mask());

        assert_eq!(irq.flags, Irq::VBlank.mask());
    }

    #[test]
    fn test_enabled_irq_wakes_halted_cpu() {
        let mut irq = InterruptControl {
            enable: Irq::Dma3.mask(),
            ..Default::default()
        };
        irq.halt();

        irq.raise(Irq::VBlank);
        assert!(irq.halted);

        irq.raise(Irq::Dma3);
        assert!(!irq.halted);
    }

    #[test]
    fn test_poll_dma_delivers_at_stamp() {
        let mut irq = InterruptControl::default();
        let mut dma = Dma::default();
        dma.channels[2].next_irq = Some(100);

        irq.poll_dma(99, &mut dma);
        assert_eq!(irq.flags, 0);

        irq.poll_dma(100, &mut dma);
        assert_eq!(irq.flags, Irq::Dma2.mask());
        assert_eq!(dma.channels[2].next_irq, None);
    }
}
