//! # Satsuma Core
//!
//! The memory subsystem of a Game Boy Advance emulator: bus fabric, wait
//! states, DMA, cartridge backup memory and snapshots. The CPU interpreter,
//! renderer and audio mixer are collaborators that drive this crate through
//! narrow interfaces; no UI code lives here.
//!
//! ## Module overview
//!
//! | Module          | Description                                        |
//! |-----------------|----------------------------------------------------|
//! | [`bus`]         | Address decoder, I/O block and DMA engine          |
//! | [`memory`]      | Region backing stores, icache, wait-state tables   |
//! | [`savedata`]    | SRAM / Flash / EEPROM backup engines               |
//! | [`cartridge`]   | ROM header parsing and save-type inference         |
//! | [`snapshot`]    | Tag/length/value freeze-thaw streams               |
//! | [`cpu`]         | The CPU state the bus consumes                     |
//! | [`interrupt`]   | IE/IF/IME and DMA interrupt delivery               |
//!
//! ## Quick start
//!
//! ```
//! use satsuma_core::bus::Bus;
//! use satsuma_core::cpu::CpuContext;
//!
//! let mut bus = Bus::default();
//! let mut cpu = CpuContext::default();
//!
//! bus.store32(0x0300_0000, 0xDEAD_BEEF, &mut cpu);
//! assert_eq!(bus.load32(0x0300_0000, &cpu), 0xDEAD_BEEF);
//! ```
//!
//! The host loop runs the interpreter until the video collaborator reports
//! a finished frame, then calls [`bus::Bus::frame_boundary`] so settled
//! save-data writes get persisted.

mod bitwise;

pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod interrupt;
pub mod memory;
pub mod savedata;
pub mod snapshot;
