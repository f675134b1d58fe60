//! EEPROM backup memory, addressed as a bit stream through DMA channel 3.
//!
//! The chip speaks a serial protocol: a request is written one bit per bus
//! access (bit 0 of each transferred halfword), and response bits are read
//! back the same way. A read request is `11`, the block address, and a
//! trailing zero; the response is 4 dummy bits followed by the 64 data bits
//! of the addressed 8-byte block, MSB first. A write request is `10`, the
//! block address, 64 data bits and a trailing zero.
//!
//! The address width (6 or 14 bits) is not discoverable from the cartridge
//! header. It is inferred from the length of the first DMA3 transfer aimed
//! at the chip: requests on a 512 B part are 9 bits long, on an 8 KiB part
//! 17 bits.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SIZE_EEPROM_512: usize = 0x0000_0200;
pub const SIZE_EEPROM_8K: usize = 0x0000_2000;

const BLOCK_BITS: u32 = 64;
const READ_DUMMY_BITS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EepromState {
    /// Collecting the two request-type bits.
    Command { value: u32, bits: u32 },
    /// Collecting the block address, MSB first.
    Address { read: bool, value: u32, bits: u32 },
    /// Collecting the 64 data bits of a write request.
    WriteData { bits: u32 },
    /// Awaiting the trailing zero that commits a write.
    WriteTerminator,
    /// Awaiting the trailing zero that arms a read.
    ReadTerminator,
    /// Producing the 4 dummy bits before read data.
    ReadDummy { remaining: u32 },
    /// Producing the 64 data bits, MSB first.
    ReadData { remaining: u32 },
}

impl EepromState {
    const fn idle() -> Self {
        Self::Command { value: 0, bits: 0 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Eeprom {
    data: Vec<u8>,
    /// 6 or 14 once known; fixed by the first DMA3 transfer.
    addr_bits: u32,
    size_known: bool,
    state: EepromState,
    address: u32,
    write_buffer: u64,
    pub write_pending: bool,
}

impl Default for Eeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl Eeprom {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0xFF; SIZE_EEPROM_8K],
            addr_bits: 14,
            size_known: false,
            state: EepromState::idle(),
            address: 0,
            write_buffer: 0,
            write_pending: false,
        }
    }

    /// Called by the DMA engine with the word count of a channel-3 transfer
    /// aimed at the chip. The first such transfer fixes the address width.
    pub fn dma_transfer_hint(&mut self, count: u32) {
        if self.size_known {
            return;
        }
        if count <= 9 {
            self.addr_bits = 6;
            self.data = vec![0xFF; SIZE_EEPROM_512];
        } else {
            self.addr_bits = 14;
            self.data = vec![0xFF; SIZE_EEPROM_8K];
        }
        self.size_known = true;
        debug!("eeprom: detected {}-bit addressing", self.addr_bits);
    }

    fn block_base(&self) -> usize {
        let blocks = self.data.len() / 8;
        (self.address as usize % blocks) * 8
    }

    /// Consumes one written bit of the request stream.
    pub fn write_bit(&mut self, bit: bool) {
        if !self.size_known {
            warn!("eeprom: written before any DMA3 transfer, assuming 14-bit addressing");
            self.size_known = true;
        }
        let bit = u32::from(bit);

        self.state = match self.state {
            EepromState::Command { value, bits } => {
                let value = value << 1 | bit;
                if bits + 1 < 2 {
                    EepromState::Command {
                        value,
                        bits: bits + 1,
                    }
                } else {
                    match value {
                        0b11 => EepromState::Address {
                            read: true,
                            value: 0,
                            bits: 0,
                        },
                        0b10 => EepromState::Address {
                            read: false,
                            value: 0,
                            bits: 0,
                        },
                        _ => {
                            debug!("eeprom: ignoring request type {value:#04b}");
                            EepromState::idle()
                        }
                    }
                }
            }
            EepromState::Address { read, value, bits } => {
                let value = value << 1 | bit;
                if bits + 1 < self.addr_bits {
                    EepromState::Address {
                        read,
                        value,
                        bits: bits + 1,
                    }
                } else {
                    self.address = value;
                    if read {
                        EepromState::ReadTerminator
                    } else {
                        self.write_buffer = 0;
                        EepromState::WriteData { bits: 0 }
                    }
                }
            }
            EepromState::WriteData { bits } => {
                self.write_buffer = self.write_buffer << 1 | u64::from(bit);
                if bits + 1 < BLOCK_BITS {
                    EepromState::WriteData { bits: bits + 1 }
                } else {
                    EepromState::WriteTerminator
                }
            }
            EepromState::WriteTerminator => {
                let base = self.block_base();
                self.data[base..base + 8].copy_from_slice(&self.write_buffer.to_be_bytes());
                self.write_pending = true;
                EepromState::idle()
            }
            EepromState::ReadTerminator => EepromState::ReadDummy {
                remaining: READ_DUMMY_BITS,
            },
            // A write while a read is streaming out aborts the read and
            // starts a fresh request.
            EepromState::ReadDummy { .. } | EepromState::ReadData { .. } => {
                self.state = EepromState::idle();
                self.write_bit(bit != 0);
                return;
            }
        };
    }

    /// Produces one bit of the response stream. Outside a read transaction
    /// the data line idles high (the chip's ready signal).
    pub fn read_bit(&mut self) -> u16 {
        match self.state {
            EepromState::ReadDummy { remaining } => {
                self.state = if remaining > 1 {
                    EepromState::ReadDummy {
                        remaining: remaining - 1,
                    }
                } else {
                    EepromState::ReadData {
                        remaining: BLOCK_BITS,
                    }
                };
                0
            }
            EepromState::ReadData { remaining } => {
                let consumed = (BLOCK_BITS - remaining) as usize;
                let byte = self.data[self.block_base() + consumed / 8];
                let bit = byte >> (7 - consumed % 8) & 1;

                self.state = if remaining > 1 {
                    EepromState::ReadData {
                        remaining: remaining - 1,
                    }
                } else {
                    EepromState::idle()
                };
                u16::from(bit)
            }
            _ => 1,
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn write_request(eeprom: &mut Eeprom, address: u32, block: u64) {
        eeprom.write_bit(true);
        eeprom.write_bit(false);
        for i in (0..eeprom.addr_bits).rev() {
            eeprom.write_bit(address >> i & 1 != 0);
        }
        for i in (0..BLOCK_BITS).rev() {
            eeprom.write_bit(block >> i & 1 != 0);
        }
        eeprom.write_bit(false);
    }

    fn read_request(eeprom: &mut Eeprom, address: u32) -> u64 {
        eeprom.write_bit(true);
        eeprom.write_bit(true);
        for i in (0..eeprom.addr_bits).rev() {
            eeprom.write_bit(address >> i & 1 != 0);
        }
        eeprom.write_bit(false);

        for _ in 0..READ_DUMMY_BITS {
            eeprom.read_bit();
        }
        let mut value = 0_u64;
        for _ in 0..BLOCK_BITS {
            value = value << 1 | u64::from(eeprom.read_bit());
        }
        value
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut eeprom = Eeprom::new();
        eeprom.dma_transfer_hint(81);

        write_request(&mut eeprom, 0x12, 0xDEAD_BEEF_CAFE_F00D);

        assert!(eeprom.write_pending);
        assert_eq!(read_request(&mut eeprom, 0x12), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn test_small_chip_inferred_from_short_transfer() {
        let mut eeprom = Eeprom::new();
        eeprom.dma_transfer_hint(9);

        assert_eq!(eeprom.addr_bits, 6);
        assert_eq!(eeprom.view().len(), SIZE_EEPROM_512);

        write_request(&mut eeprom, 0x3F, 0x0123_4567_89AB_CDEF);
        assert_eq!(read_request(&mut eeprom, 0x3F), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn test_hint_only_applies_once() {
        let mut eeprom = Eeprom::new();
        eeprom.dma_transfer_hint(17);
        eeprom.dma_transfer_hint(9);

        assert_eq!(eeprom.addr_bits, 14);
        assert_eq!(eeprom.view().len(), SIZE_EEPROM_8K);
    }

    #[test]
    fn test_idle_reads_return_ready_bit() {
        let mut eeprom = Eeprom::new();
        eeprom.dma_transfer_hint(17);

        assert_eq!(eeprom.read_bit(), 1);
    }

    #[test]
    fn test_erased_chip_reads_ones() {
        let mut eeprom = Eeprom::new();
        eeprom.dma_transfer_hint(17);

        assert_eq!(read_request(&mut eeprom, 0), u64::MAX);
    }
}
