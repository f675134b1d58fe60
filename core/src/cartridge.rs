//! Cartridge image metadata.
//!
//! A GBA ROM carries a 192-byte header: title at `0xA0`, game code at
//! `0xAC`, maker code at `0xB0`, a fixed byte `0x96` at `0xB2` and a
//! complement checksum over `0xA0..0xBD`. The fixed byte is the only hard
//! validity gate; a bad checksum only earns a warning, real dumps with
//! patched headers are common.
//!
//! The kind of backup memory a cartridge carries is not in the header at
//! all. Games embed a library version string (`SRAM_V`, `FLASH1M_V`, ...)
//! in their ROM, so the loader scans for those tokens and falls back to
//! SRAM when none is found.

use std::error::Error;
use std::fmt;

use tracing::warn;

const HEADER_TITLE: usize = 0x0A0;
const HEADER_GAME_CODE: usize = 0x0AC;
const HEADER_MAKER_CODE: usize = 0x0B0;
const HEADER_FIXED_VALUE: usize = 0x0B2;
const HEADER_CHECKSUM: usize = 0x0BD;
const HEADER_LEN: usize = 0x0C0;

const FIXED_VALUE: u8 = 0x96;

/// Save-type scan starts past the header and entry code.
const SAVE_TOKEN_SCAN_START: usize = 0x0E4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartridgeError {
    /// Image too small to hold a header.
    TooShort { len: usize },
    /// The fixed byte at `0xB2` is wrong.
    InvalidHeader { fixed_value: u8 },
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => {
                write!(f, "ROM image of {len} bytes is too short for a header")
            }
            Self::InvalidHeader { fixed_value } => write!(
                f,
                "header fixed value is {fixed_value:#04X}, expected {FIXED_VALUE:#04X}"
            ),
        }
    }
}

impl Error for CartridgeError {}

/// Backup hardware inferred from the ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Sram,
    Flash512,
    Flash1M,
    Eeprom,
}

const SAVE_TOKENS: [(&[u8], SaveKind); 5] = [
    (b"SRAM_V", SaveKind::Sram),
    (b"EEPROM_V", SaveKind::Eeprom),
    (b"FLASH1M_V", SaveKind::Flash1M),
    (b"FLASH512_V", SaveKind::Flash512),
    (b"FLASH_V", SaveKind::Flash512),
];

#[derive(Debug, PartialEq)]
pub struct Cartridge {
    pub title: String,
    pub game_code: String,
    pub maker_code: String,
    pub save_kind: SaveKind,
}

impl Cartridge {
    pub fn parse(rom: &[u8]) -> Result<Self, CartridgeError> {
        if rom.len() < HEADER_LEN {
            return Err(CartridgeError::TooShort { len: rom.len() });
        }

        let fixed_value = rom[HEADER_FIXED_VALUE];
        if fixed_value != FIXED_VALUE {
            return Err(CartridgeError::InvalidHeader { fixed_value });
        }

        let checksum = Self::header_checksum(rom);
        if checksum != rom[HEADER_CHECKSUM] {
            warn!(
                "header checksum mismatch: stored {:#04X}, calculated {checksum:#04X}",
                rom[HEADER_CHECKSUM]
            );
        }

        let cart = Self {
            title: Self::ascii_field(&rom[HEADER_TITLE..HEADER_GAME_CODE]),
            game_code: Self::ascii_field(&rom[HEADER_GAME_CODE..HEADER_MAKER_CODE]),
            maker_code: Self::ascii_field(&rom[HEADER_MAKER_CODE..HEADER_FIXED_VALUE]),
            save_kind: Self::detect_save_kind(rom),
        };
        Ok(cart)
    }

    /// `checksum = -(sum of bytes 0xA0..0xBD) - 0x19`
    fn header_checksum(rom: &[u8]) -> u8 {
        rom[HEADER_TITLE..HEADER_CHECKSUM]
            .iter()
            .fold(0_u8, |acc, byte| acc.wrapping_sub(*byte))
            .wrapping_sub(0x19)
    }

    fn ascii_field(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Substring-scans the image for a save-library version token, from the
    /// end of the header onwards.
    fn detect_save_kind(rom: &[u8]) -> SaveKind {
        let mut offset = SAVE_TOKEN_SCAN_START;
        while offset < rom.len() {
            for (token, kind) in SAVE_TOKENS {
                if rom[offset..].starts_with(token) {
                    return kind;
                }
            }
            offset += 1;
        }
        SaveKind::Sram
    }
}
