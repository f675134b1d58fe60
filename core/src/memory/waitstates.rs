//! Wait-state tables charged onto the CPU clock for every bus access.
//!
//! Six 256-entry vectors are indexed by the region number (the high byte of
//! the address): plain and 32-bit, non-sequential and sequential, plus the
//! two prefetch variants the instruction fetcher uses. Writing `WAITCNT`
//! recomputes all six from the cartridge timing tables.

use crate::bitwise::Bits;
use crate::cpu::CpuContext;
use crate::memory::{REGION_CART0, REGION_CART_SRAM};

/// Non-sequential ROM/SRAM penalties selectable per `WAITCNT` field.
pub const ROM_WS: [u32; 4] = [4, 3, 2, 8];
/// Sequential ROM penalties, indexed by cartridge window and the one-bit
/// select of its `WAITCNT` field.
pub const ROM_WS_SEQ: [[u32; 2]; 3] = [[2, 1], [4, 1], [8, 1]];

const REGION_COUNT: usize = 256;

/// Hardware reset timings for the fixed regions (on-board WRAM sits on a
/// 16-bit bus, palette/VRAM on video-shared ports).
const RESET_WAITSTATES: [u32; 16] = [0, 0, 2, 0, 0, 0, 0, 0, 4, 4, 4, 4, 4, 4, 4, 0];
const RESET_WAITSTATES_32: [u32; 16] = [0, 0, 5, 0, 0, 1, 0, 0, 7, 7, 9, 9, 13, 13, 8, 0];
const RESET_WAITSTATES_SEQ: [u32; 16] = [0, 0, 2, 0, 0, 0, 0, 0, 2, 2, 4, 4, 8, 8, 4, 0];
const RESET_WAITSTATES_SEQ_32: [u32; 16] = [0, 0, 5, 0, 0, 1, 0, 0, 5, 5, 9, 9, 17, 17, 8, 0];

#[derive(Debug)]
pub struct Waitstates {
    waitstates: [u32; REGION_COUNT],
    waitstates32: [u32; REGION_COUNT],
    waitstates_seq: [u32; REGION_COUNT],
    waitstates_seq32: [u32; REGION_COUNT],
    waitstates_prefetch: [u32; REGION_COUNT],
    waitstates_prefetch32: [u32; REGION_COUNT],
}

impl Default for Waitstates {
    fn default() -> Self {
        let mut this = Self {
            waitstates: [0; REGION_COUNT],
            waitstates32: [0; REGION_COUNT],
            waitstates_seq: [0; REGION_COUNT],
            waitstates_seq32: [0; REGION_COUNT],
            waitstates_prefetch: [0; REGION_COUNT],
            waitstates_prefetch32: [0; REGION_COUNT],
        };
        this.waitstates[..16].copy_from_slice(&RESET_WAITSTATES);
        this.waitstates32[..16].copy_from_slice(&RESET_WAITSTATES_32);
        this.waitstates_seq[..16].copy_from_slice(&RESET_WAITSTATES_SEQ);
        this.waitstates_seq32[..16].copy_from_slice(&RESET_WAITSTATES_SEQ_32);
        this.waitstates_prefetch[..16].copy_from_slice(&RESET_WAITSTATES_SEQ);
        this.waitstates_prefetch32[..16].copy_from_slice(&RESET_WAITSTATES_SEQ_32);
        this
    }
}

impl Waitstates {
    /// Decodes a `WAITCNT` write and recomputes every vector.
    ///
    /// | bits  | field                        |
    /// |-------|------------------------------|
    /// | 0-1   | SRAM penalty                 |
    /// | 2-4   | window 0 non-seq / seq       |
    /// | 5-7   | window 1 non-seq / seq       |
    /// | 8-10  | window 2 non-seq / seq       |
    /// | 14    | prefetch enable              |
    pub fn adjust_timings(&mut self, word: u16) {
        let sram = ROM_WS[word.get_bits(0..=1) as usize];
        for table in [
            &mut self.waitstates,
            &mut self.waitstates32,
            &mut self.waitstates_seq,
            &mut self.waitstates_seq32,
            &mut self.waitstates_prefetch,
            &mut self.waitstates_prefetch32,
        ] {
            table[REGION_CART_SRAM] = sram;
        }

        let windows = [
            (word.get_bits(2..=3), word.get_bit(4)),
            (word.get_bits(5..=6), word.get_bit(7)),
            (word.get_bits(8..=9), word.get_bit(10)),
        ];
        let prefetch = word.get_bit(14);

        for (window, (nonseq, seq_select)) in windows.into_iter().enumerate() {
            let nonseq = ROM_WS[nonseq as usize];
            let seq = ROM_WS_SEQ[window][seq_select as usize];

            // Both slots of the pair carry the window's timing.
            for slot in [REGION_CART0 + window * 2, REGION_CART0 + window * 2 + 1] {
                self.waitstates[slot] = nonseq;
                self.waitstates_seq[slot] = seq;
                // A 32-bit cart access is two 16-bit beats.
                self.waitstates32[slot] = nonseq + 1 + seq;
                self.waitstates_seq32[slot] = 2 * seq + 1;

                if prefetch {
                    self.waitstates_prefetch[slot] = 0;
                    self.waitstates_prefetch32[slot] = 0;
                } else {
                    self.waitstates_prefetch[slot] = self.waitstates_seq[slot];
                    self.waitstates_prefetch32[slot] = self.waitstates_seq32[slot];
                }
            }
        }
    }

    pub fn wait(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates[region]);
    }

    pub fn wait_seq(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates_seq[region]);
    }

    pub fn wait32(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates32[region]);
    }

    pub fn wait_seq32(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates_seq32[region]);
    }

    pub fn wait_prefetch(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates_prefetch[region]);
    }

    pub fn wait_prefetch32(&self, cpu: &mut CpuContext, region: usize) {
        cpu.cycles += u64::from(1 + self.waitstates_prefetch32[region]);
    }

    /// Multiply timing: 1 to 4 internal cycles depending on the position of
    /// the most significant byte of the multiplier that is not a sign
    /// extension.
    pub fn wait_mul(&self, cpu: &mut CpuContext, rs: u32) {
        let cycles = if rs & 0xFFFF_FF00 == 0xFFFF_FF00 || rs & 0xFFFF_FF00 == 0 {
            1
        } else if rs & 0xFFFF_0000 == 0xFFFF_0000 || rs & 0xFFFF_0000 == 0 {
            2
        } else if rs & 0xFF00_0000 == 0xFF00_0000 || rs & 0xFF00_0000 == 0 {
            3
        } else {
            4
        };
        cpu.cycles += cycles;
    }

    /// Burst access: one non-sequential 32-bit access followed by `count - 1`
    /// sequential ones (LDM/STM, DMA bursts).
    pub fn wait_multi32(&self, cpu: &mut CpuContext, region: usize, count: u32) {
        cpu.cycles += u64::from(1 + self.waitstates32[region]);
        cpu.cycles += u64::from((1 + self.waitstates_seq32[region]) * (count - 1));
    }

    // Raw table reads for the DMA completion-interrupt formula.

    #[must_use]
    pub fn nonseq(&self, region: usize, width: u32) -> u32 {
        match width {
            4 => self.waitstates32[region],
            _ => self.waitstates[region],
        }
    }

    #[must_use]
    pub fn seq(&self, region: usize, width: u32) -> u32 {
        match width {
            4 => self.waitstates_seq32[region],
            _ => self.waitstates_seq[region],
        }
    }

    #[cfg(test)]
    pub(crate) fn prefetch(&self, region: usize) -> u32 {
        self.waitstates_prefetch[region]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waitcnt_recompute() {
        let mut waits = Waitstates::default();

        // prefetch on, window 0 non-seq select 1, window 0 seq select 1
        waits.adjust_timings(0x4014);

        assert_eq!(waits.waitstates[0x8], 3);
        assert_eq!(waits.waitstates[0x9], 3);
        assert_eq!(waits.waitstates_seq[0x8], 1);
        assert_eq!(waits.waitstates32[0x8], 3 + 1 + 1);
        assert_eq!(waits.waitstates_prefetch[0x8], 0);
        assert_eq!(waits.waitstates_prefetch32[0x8], 0);
    }

    #[test]
    fn test_prefetch_disabled_matches_sequential() {
        let mut waits = Waitstates::default();

        waits.adjust_timings(0x0014);

        for slot in 0x8..=0xD {
            assert_eq!(waits.waitstates_prefetch[slot], waits.waitstates_seq[slot]);
            assert_eq!(
                waits.waitstates_prefetch32[slot],
                waits.waitstates_seq32[slot]
            );
        }
    }

    #[test]
    fn test_sram_penalty_applies_to_every_vector() {
        let mut waits = Waitstates::default();

        waits.adjust_timings(0x0003);

        assert_eq!(waits.waitstates[REGION_CART_SRAM], 8);
        assert_eq!(waits.waitstates_seq[REGION_CART_SRAM], 8);
        assert_eq!(waits.waitstates32[REGION_CART_SRAM], 8);
        assert_eq!(waits.waitstates_prefetch[REGION_CART_SRAM], 8);
    }

    #[test]
    fn test_wait_charges_cycles() {
        let waits = Waitstates::default();
        let mut cpu = CpuContext::default();

        waits.wait(&mut cpu, 0x8);
        assert_eq!(cpu.cycles, 5);

        waits.wait_seq(&mut cpu, 0x2);
        assert_eq!(cpu.cycles, 8);
    }

    #[test]
    fn test_wait_mul_by_significant_byte() {
        let waits = Waitstates::default();

        let charged = |rs: u32| {
            let mut cpu = CpuContext::default();
            waits.wait_mul(&mut cpu, rs);
            cpu.cycles
        };

        assert_eq!(charged(0), 1);
        assert_eq!(charged(0xFF), 1);
        assert_eq!(charged(0xFFFF_FFFF), 1);
        assert_eq!(charged(0x1_00), 2);
        assert_eq!(charged(0xFFFF_1234), 2);
        assert_eq!(charged(0xAB_0000), 3);
        assert_eq!(charged(0x1200_0000), 4);
    }

    #[test]
    fn test_wait_multi32_burst() {
        let mut waits = Waitstates::default();
        waits.adjust_timings(0x4014);
        let mut cpu = CpuContext::default();

        // One non-sequential access plus three sequential ones.
        waits.wait_multi32(&mut cpu, 0x8, 4);
        assert_eq!(cpu.cycles, ((1 + 5) + 3 * (1 + 3)) as u64);
    }
}
