//! Memory map constants and the submodules of the bus fabric.
//!
//! The 32-bit address space is decoded by its high byte into sixteen region
//! slots (everything at and above `0x1000_0000` is open bus):
//!
//! | Slot | Range                     | Contents                         |
//! |------|---------------------------|----------------------------------|
//! | 0x0  | `0x0000_0000-0000_3FFF`   | BIOS (16 KiB, read-only)         |
//! | 0x1  | -                         | unused (open bus)                |
//! | 0x2  | `0x0200_0000-0203_FFFF`   | on-board WRAM (256 KiB)          |
//! | 0x3  | `0x0300_0000-0300_7FFF`   | on-chip IWRAM (32 KiB)           |
//! | 0x4  | `0x0400_0000-0400_03FF`   | I/O registers                    |
//! | 0x5  | `0x0500_0000-0500_03FF`   | palette RAM                      |
//! | 0x6  | `0x0600_0000-0601_7FFF`   | VRAM                             |
//! | 0x7  | `0x0700_0000-0700_03FF`   | OAM                              |
//! | 0x8-9| `0x0800_0000-09FF_FFFF`   | cartridge window 0 (wait state 0)|
//! | 0xA-B| `0x0A00_0000-0BFF_FFFF`   | cartridge window 1 (wait state 1)|
//! | 0xC-D| `0x0C00_0000-0DFF_FFFF`   | cartridge window 2 (wait state 2)|
//! | 0xE  | `0x0E00_0000-0E00_FFFF`   | SRAM / Flash backup              |
//! | 0xF  | -                         | unused (open bus)                |
//!
//! A slot's pair partner (9/B/D) carries the upper 16 MiB of a > 16 MiB ROM,
//! or the EEPROM backup in the case of slot 0xD.

pub mod dma;
pub mod icache;
pub mod io_registers;
pub mod regions;
pub mod waitstates;

pub const REGION_BIOS: usize = 0x0;
pub const REGION_WORKING_RAM: usize = 0x2;
pub const REGION_WORKING_IRAM: usize = 0x3;
pub const REGION_IO: usize = 0x4;
pub const REGION_PALETTE_RAM: usize = 0x5;
pub const REGION_VRAM: usize = 0x6;
pub const REGION_OAM: usize = 0x7;
pub const REGION_CART0: usize = 0x8;
pub const REGION_CART1: usize = 0xA;
pub const REGION_CART2: usize = 0xC;
pub const REGION_CART_SRAM: usize = 0xE;

pub const SIZE_BIOS: usize = 0x0000_4000;
pub const SIZE_WORKING_RAM: usize = 0x0004_0000;
pub const SIZE_WORKING_IRAM: usize = 0x0000_8000;
pub const SIZE_PALETTE_RAM: usize = 0x0000_0400;
/// The render path owns the real 96 KiB VRAM layout; the default block
/// covers the full 128 KiB window so the mask stays a power of two.
pub const SIZE_VRAM: usize = 0x0002_0000;
pub const SIZE_OAM: usize = 0x0000_0400;
pub const SIZE_CART: usize = 0x0200_0000;

/// Byte offset of a ROM's upper half, carried by the high cart slots.
pub const CART_HIGH_BASE: usize = 0x0100_0000;
/// Fixed address mask of the 32 MiB cartridge space.
pub const CART_MASK: u32 = 0x01FF_FFFF;

/// Shift that extracts the region number from a 32-bit address.
pub const BASE_OFFSET: u32 = 24;
/// Offset masks applied by the address decoder before region dispatch.
pub const OFFSET_MASK: u32 = 0x00FF_FFFF;
pub const OFFSET_MASK_16: u32 = 0x00FF_FFFE;
pub const OFFSET_MASK_32: u32 = 0x00FF_FFFC;

/// Instruction-cache page sizes per region kind.
pub const ICACHE_PAGE_BITS_RAM: u32 = 9;
pub const ICACHE_PAGE_BITS_IRAM: u32 = 7;
pub const ICACHE_PAGE_BITS_ROM: u32 = 10;
pub const ICACHE_PAGE_BITS_BIOS: u32 = 16;
