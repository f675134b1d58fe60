use serde::{Deserialize, Serialize};

pub const SIZE_SRAM: usize = 0x0000_8000;

/// Battery-backed SRAM, 32 KiB on an 8-bit bus. Every store marks the save
/// dirty; the bus flushes it at a frame boundary once writes settle.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sram {
    data: Vec<u8>,
    mask: u32,
    pub write_pending: bool,
}

impl Default for Sram {
    fn default() -> Self {
        Self::new()
    }
}

impl Sram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0; SIZE_SRAM],
            mask: (SIZE_SRAM - 1) as u32,
            write_pending: false,
        }
    }

    pub fn load8(&self, offset: u32) -> u8 {
        self.data[(offset & self.mask) as usize]
    }

    pub fn load16(&self, offset: u32) -> u16 {
        let lo = self.load8(offset);
        let hi = self.load8(offset.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    pub fn load32(&self, offset: u32) -> u32 {
        u32::from(self.load16(offset)) | u32::from(self.load16(offset.wrapping_add(2))) << 16
    }

    pub fn store8(&mut self, offset: u32, value: u8) {
        self.data[(offset & self.mask) as usize] = value;
        self.write_pending = true;
    }

    pub fn store16(&mut self, offset: u32, value: u16) {
        self.store8(offset, value as u8);
        self.store8(offset.wrapping_add(1), (value >> 8) as u8);
    }

    pub fn store32(&mut self, offset: u32, value: u32) {
        self.store16(offset, value as u16);
        self.store16(offset.wrapping_add(2), (value >> 16) as u16);
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
