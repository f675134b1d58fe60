//! The bus fabric: address decoding, the I/O block, the DMA engine and the
//! glue between them.
//!
//! Every CPU fetch, load and store goes through [`Bus`]. The high byte of
//! the address picks a region slot; the offset is masked to the 16 MiB
//! window (aligned for stores) and handed to the region. After a store the
//! decoder invalidates any instruction-cache page covering the written
//! bytes. Accesses to slot 4 are intercepted and routed to the I/O
//! registers, which is also where DMA programming and `WAITCNT` writes
//! enter the core.

use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::bitwise::Bits;
use crate::cartridge::{Cartridge, CartridgeError, SaveKind};
use crate::cpu::{CpuContext, ExecMode};
use crate::interrupt::InterruptControl;
use crate::memory::dma::{AddressControl, Dma, DmaTiming};
use crate::memory::icache::{CachePage, IcacheUnavailable};
use crate::memory::io_registers::{
    dma_control_offset, IoRegisters, IO_DMA_BANK_LEN, IO_DMA_BASE, IO_HALTCNT, IO_IE, IO_IF,
    IO_IME, IO_POSTFLG, IO_WAITCNT,
};
use crate::memory::regions::{BiosView, MemoryBlock, Region, RomView};
use crate::memory::waitstates::Waitstates;
use crate::memory::{
    BASE_OFFSET, CART_HIGH_BASE, ICACHE_PAGE_BITS_BIOS, ICACHE_PAGE_BITS_IRAM,
    ICACHE_PAGE_BITS_RAM, ICACHE_PAGE_BITS_ROM, OFFSET_MASK, OFFSET_MASK_16, OFFSET_MASK_32,
    REGION_BIOS, REGION_CART0, REGION_CART1, REGION_CART2, REGION_CART_SRAM,
    REGION_WORKING_IRAM, REGION_WORKING_RAM, SIZE_OAM, SIZE_PALETTE_RAM, SIZE_VRAM,
    SIZE_WORKING_IRAM, SIZE_WORKING_RAM,
};
use crate::savedata::{Backup, Eeprom, Flash, FlashSize, Sram};
use crate::snapshot::{self, Node, SnapshotError};

/// Host-side persistence for save data, keyed by the cartridge game code.
/// The wire form is base64 of the raw backup bytes.
pub trait SaveStore {
    fn save(&mut self, code: &str, data: &str);
    fn load(&mut self, code: &str) -> Option<String>;
}

/// Outcome of slot resolution, before any region is touched.
enum Slot {
    Index(usize),
    Io,
    OpenBus,
}

pub struct Bus {
    regions: [Region; 16],
    pub waits: Waitstates,
    pub dma: Dma,
    pub io: IoRegisters,
    pub irq: InterruptControl,
    cart: Option<Cartridge>,
    backup_slot: Option<usize>,
    /// Set when a dirty save was seen at a frame boundary; the save is
    /// persisted one frame later if no further writes arrived.
    save_seen: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            regions: [
                Region::Bios(BiosView::new(Vec::new(), ICACHE_PAGE_BITS_BIOS)),
                Region::OpenBus,
                Region::Ram(MemoryBlock::new(
                    SIZE_WORKING_RAM,
                    Some(ICACHE_PAGE_BITS_RAM),
                )),
                Region::Ram(MemoryBlock::new(
                    SIZE_WORKING_IRAM,
                    Some(ICACHE_PAGE_BITS_IRAM),
                )),
                Region::Io,
                Region::Ram(MemoryBlock::new(SIZE_PALETTE_RAM, None)),
                Region::Ram(MemoryBlock::new(SIZE_VRAM, None)),
                Region::Ram(MemoryBlock::new(SIZE_OAM, None)),
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
                Region::OpenBus,
            ],
            waits: Waitstates::default(),
            dma: Dma::default(),
            io: IoRegisters::default(),
            irq: InterruptControl::default(),
            cart: None,
            backup_slot: None,
            save_seen: false,
        }
    }
}

impl Bus {
    fn resolve_slot(&self, region: usize) -> Slot {
        let Some(slot) = self.regions.get(region) else {
            return Slot::OpenBus;
        };
        match slot {
            Region::Mirror(target) => match self.regions[*target] {
                Region::OpenBus => Slot::OpenBus,
                _ => Slot::Index(*target),
            },
            Region::Io => Slot::Io,
            Region::OpenBus => Slot::OpenBus,
            _ => Slot::Index(region),
        }
    }

    // ------------------------------------------------------------------
    // Loads and stores
    // ------------------------------------------------------------------

    pub fn load_u8(&mut self, address: u32, cpu: &CpuContext) -> u8 {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK;
        match self.resolve_slot(region) {
            Slot::Index(slot) => self.regions[slot].load_u8(offset),
            Slot::Io => self
                .io_load16(offset & !1, cpu)
                .get_byte((offset & 1) as u8),
            Slot::OpenBus => self.open_bus_load8(address, cpu),
        }
    }

    pub fn load8(&mut self, address: u32, cpu: &CpuContext) -> i8 {
        self.load_u8(address, cpu) as i8
    }

    pub fn load_u16(&mut self, address: u32, cpu: &CpuContext) -> u16 {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK;
        match self.resolve_slot(region) {
            Slot::Index(slot) => self.regions[slot].load_u16(offset),
            Slot::Io => self.io_load16(offset & !1, cpu),
            Slot::OpenBus => self.open_bus_load16(address, cpu),
        }
    }

    pub fn load16(&mut self, address: u32, cpu: &CpuContext) -> i16 {
        self.load_u16(address, cpu) as i16
    }

    pub fn load32(&mut self, address: u32, cpu: &CpuContext) -> u32 {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK;
        match self.resolve_slot(region) {
            Slot::Index(slot) => self.regions[slot].load32(offset),
            Slot::Io => {
                let aligned = offset & !3;
                let word = u32::from(self.io_load16(aligned, cpu))
                    | u32::from(self.io_load16(aligned + 2, cpu)) << 16;
                word.rotate_right((offset & 3) * 8)
            }
            Slot::OpenBus => self.open_bus_load32(cpu),
        }
    }

    pub fn store8(&mut self, address: u32, value: u8, cpu: &mut CpuContext) {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK;
        match self.resolve_slot(region) {
            Slot::Index(slot) => {
                self.regions[slot].store8(offset, value);
                self.regions[slot].invalidate_page(offset);
            }
            Slot::Io => self.io_store8(offset, value, cpu),
            Slot::OpenBus => debug!("ignoring byte store to unmapped {address:#010X}"),
        }
    }

    pub fn store16(&mut self, address: u32, value: u16, cpu: &mut CpuContext) {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK_16;
        match self.resolve_slot(region) {
            Slot::Index(slot) => {
                self.regions[slot].store16(offset, value);
                self.regions[slot].invalidate_page(offset);
            }
            Slot::Io => self.io_store16(offset, value, cpu),
            Slot::OpenBus => debug!("ignoring halfword store to unmapped {address:#010X}"),
        }
    }

    pub fn store32(&mut self, address: u32, value: u32, cpu: &mut CpuContext) {
        let region = (address >> BASE_OFFSET) as usize;
        let offset = address & OFFSET_MASK_32;
        match self.resolve_slot(region) {
            Slot::Index(slot) => {
                self.regions[slot].store32(offset, value);
                self.regions[slot].invalidate_page(offset);
                self.regions[slot].invalidate_page(offset + 2);
            }
            Slot::Io => {
                self.io_store16(offset, value as u16, cpu);
                self.io_store16(offset + 2, (value >> 16) as u16, cpu);
            }
            Slot::OpenBus => debug!("ignoring word store to unmapped {address:#010X}"),
        }
    }

    // ------------------------------------------------------------------
    // Open bus
    // ------------------------------------------------------------------

    /// Address of the instruction word the CPU prefetched last, or `None`
    /// when the program counter itself points at unmapped memory.
    fn prefetch_address(&self, cpu: &CpuContext) -> Option<u32> {
        let address = cpu.pc.wrapping_sub(cpu.instruction_width());
        match self.resolve_slot((address >> BASE_OFFSET) as usize) {
            Slot::OpenBus => None,
            _ => Some(address),
        }
    }

    fn open_bus_load8(&mut self, address: u32, cpu: &CpuContext) -> u8 {
        match self.prefetch_address(cpu) {
            Some(base) => self.load_u8(base.wrapping_add(address & 3), cpu),
            None => {
                warn!("open-bus byte read with unmapped PC {:#010X}", cpu.pc);
                0
            }
        }
    }

    fn open_bus_load16(&mut self, address: u32, cpu: &CpuContext) -> u16 {
        match self.prefetch_address(cpu) {
            Some(base) => self.load_u16(base.wrapping_add(address & 2), cpu),
            None => {
                warn!("open-bus halfword read with unmapped PC {:#010X}", cpu.pc);
                0
            }
        }
    }

    fn open_bus_load32(&mut self, cpu: &CpuContext) -> u32 {
        match self.prefetch_address(cpu) {
            Some(base) => match cpu.exec_mode {
                ExecMode::Arm => self.load32(base, cpu),
                // In Thumb state only a halfword was prefetched; it shows
                // up duplicated in both halves of the word.
                ExecMode::Thumb => {
                    let half = u32::from(self.load_u16(base, cpu));
                    half | half << 16
                }
            },
            None => {
                warn!("open-bus word read with unmapped PC {:#010X}", cpu.pc);
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // I/O block
    // ------------------------------------------------------------------

    fn io_load16(&mut self, offset: u32, cpu: &CpuContext) -> u16 {
        match offset {
            IO_IE => self.irq.enable,
            IO_IF => self.irq.flags,
            IO_WAITCNT => self.io.value(IO_WAITCNT),
            IO_IME => u16::from(self.irq.master_enable),
            IO_POSTFLG => u16::from(self.irq.post_boot_flag),
            0x0B0..=0x0DF => {
                let bank_offset = (offset - IO_DMA_BASE) % IO_DMA_BANK_LEN;
                if bank_offset == 0xA {
                    self.io.value(offset)
                } else {
                    debug!("read of write-only DMA register {offset:#05X}");
                    0
                }
            }
            // Video and audio registers belong to their collaborators; the
            // raw block keeps whatever they programmed.
            0x000..=0x0AF => self.io.value(offset),
            _ => {
                warn!("STUB: unknown I/O read at {offset:#05X}");
                self.open_bus_load16(0x0400_0000 | offset, cpu)
            }
        }
    }

    fn io_store16(&mut self, offset: u32, value: u16, cpu: &mut CpuContext) {
        match offset {
            IO_WAITCNT => {
                self.io.set_value(IO_WAITCNT, value);
                self.waits.adjust_timings(value);
            }
            IO_IE => self.irq.enable = value,
            // Writing ones acknowledges raised request lines.
            IO_IF => self.irq.acknowledge(value),
            IO_IME => self.irq.master_enable = value & 1 != 0,
            IO_POSTFLG => {
                self.irq.post_boot_flag = value as u8;
                // The upper byte is HALTCNT.
                self.halt_control((value >> 8) as u8);
            }
            0x0B0..=0x0DF => self.dma_register_store16(offset, value, cpu),
            0x000..=0x0AF => {
                debug!("I/O write {value:#06X} at {offset:#05X} held for collaborator");
                self.io.set_value(offset, value);
            }
            _ => warn!("STUB: unknown I/O write {value:#06X} at {offset:#05X}, discarded"),
        }
    }

    fn io_store8(&mut self, offset: u32, value: u8, cpu: &mut CpuContext) {
        match offset {
            IO_POSTFLG => self.irq.post_boot_flag = value,
            IO_HALTCNT => self.halt_control(value),
            // IF acknowledges by written bits, so the other byte lane must
            // not be re-written.
            IO_IF => self.irq.acknowledge(u16::from(value)),
            _ if offset == IO_IF + 1 => self.irq.acknowledge(u16::from(value) << 8),
            _ => {
                let current = self.io.value(offset & !1);
                let merged = if offset & 1 == 0 {
                    (current & 0xFF00) | u16::from(value)
                } else {
                    (current & 0x00FF) | u16::from(value) << 8
                };
                self.io_store16(offset & !1, merged, cpu);
            }
        }
    }

    fn halt_control(&mut self, value: u8) {
        if value & 0x80 != 0 {
            warn!("STUB: stop mode requested, treating as halt");
        }
        self.irq.halt();
    }

    // ------------------------------------------------------------------
    // DMA engine
    // ------------------------------------------------------------------

    fn dma_register_store16(&mut self, offset: u32, value: u16, cpu: &mut CpuContext) {
        let bank = offset - IO_DMA_BASE;
        let channel = (bank / IO_DMA_BANK_LEN) as usize;
        let base = IO_DMA_BASE + IO_DMA_BANK_LEN * channel as u32;
        self.io.set_value(offset, value);

        match bank % IO_DMA_BANK_LEN {
            0x0 | 0x2 => {
                let word =
                    u32::from(self.io.value(base)) | u32::from(self.io.value(base + 2)) << 16;
                self.dma.set_source_address(channel, word);
            }
            0x4 | 0x6 => {
                let word =
                    u32::from(self.io.value(base + 4)) | u32::from(self.io.value(base + 6)) << 16;
                self.dma.set_dest_address(channel, word);
            }
            0x8 => self.dma.set_word_count(channel, value),
            0xA => {
                if self.dma.channels[channel].write_control(value) {
                    self.schedule_dma(channel, cpu);
                }
            }
            _ => debug!("write to DMA register padding at {offset:#05X}"),
        }
    }

    fn schedule_dma(&mut self, channel: usize, cpu: &mut CpuContext) {
        match self.dma.channels[channel].timing {
            DmaTiming::Immediate => self.service_dma(channel, cpu),
            // The video collaborator drives these through the runners.
            DmaTiming::VBlank | DmaTiming::HBlank => {}
            DmaTiming::Custom => match channel {
                1 | 2 => debug!("audio FIFO DMA armed on channel {channel}"),
                3 => warn!("STUB: video capture DMA is not implemented"),
                _ => warn!("custom timing is invalid on DMA channel 0"),
            },
        }
    }

    /// Runs every enabled channel waiting on the vertical blank. Called by
    /// the video collaborator before the CPU resumes.
    pub fn run_vblank_dmas(&mut self, cpu: &mut CpuContext) {
        for channel in 0..4 {
            let info = &self.dma.channels[channel];
            if info.enable && info.timing == DmaTiming::VBlank {
                self.service_dma(channel, cpu);
            }
        }
    }

    /// As [`Self::run_vblank_dmas`], for the horizontal blank.
    pub fn run_hblank_dmas(&mut self, cpu: &mut CpuContext) {
        for channel in 0..4 {
            let info = &self.dma.channels[channel];
            if info.enable && info.timing == DmaTiming::HBlank {
                self.service_dma(channel, cpu);
            }
        }
    }

    /// Audio FIFO refill: four words into the fixed FIFO address. The audio
    /// collaborator calls this when a FIFO drains below its threshold.
    pub fn service_fifo_dma(&mut self, channel: usize, cpu: &mut CpuContext) {
        if channel != 1 && channel != 2 {
            warn!("FIFO DMA requested on channel {channel}");
            return;
        }
        let info = &mut self.dma.channels[channel];
        if !info.enable || info.timing != DmaTiming::Custom {
            return;
        }
        info.width = 4;
        info.dst_control = AddressControl::Fixed;
        info.next_count = 4;
        self.service_dma(channel, cpu);
    }

    /// Services one transfer of the given channel: moves `next_count`
    /// units, advances the shadow registers, queues the completion
    /// interrupt and handles repeat/disable.
    pub fn service_dma(&mut self, channel: usize, cpu: &mut CpuContext) {
        let info = self.dma.channels[channel];
        if !info.enable {
            return;
        }

        let width = info.width;
        let count = info.next_count;
        let source_step = info.src_control.offset() * width as i32;
        let dest_step = info.dst_control.offset() * width as i32;
        let source = info.next_source & !(width - 1);
        let dest = info.next_dest & !(width - 1);
        let source_region = (source >> BASE_OFFSET) as usize;
        let dest_region = (dest >> BASE_OFFSET) as usize;

        // EEPROM transfers are what teach the chip its address width.
        if channel == 3 {
            self.eeprom_dma_hint(source_region, count);
            self.eeprom_dma_hint(dest_region, count);
        }

        let mapped = !matches!(self.resolve_slot(source_region), Slot::OpenBus)
            && !matches!(self.resolve_slot(dest_region), Slot::OpenBus);
        if mapped {
            self.dma_transfer(source, dest, count, width, source_step, dest_step, cpu);
        } else {
            warn!(
                "DMA {channel} from {source:#010X} to {dest:#010X} touches unmapped memory, \
                 transfer skipped"
            );
        }

        let info = &mut self.dma.channels[channel];
        info.next_source = source.wrapping_add_signed(source_step * count as i32);
        info.next_dest = dest.wrapping_add_signed(dest_step * count as i32);
        info.next_count = 0;

        if info.do_irq {
            let nonseq = self.waits.nonseq(source_region, width)
                + self.waits.nonseq(dest_region, width);
            let seq =
                self.waits.seq(source_region, width) + self.waits.seq(dest_region, width);
            info.next_irq = Some(
                cpu.cycles
                    + 2
                    + u64::from(nonseq)
                    + u64::from(info.count.saturating_sub(1)) * u64::from(seq),
            );
        }

        if info.repeat {
            info.next_count = info.count;
            if info.dst_control == AddressControl::IncrementReload {
                info.next_dest = info.dest;
            }
            if info.timing == DmaTiming::Immediate {
                warn!("repeating DMA {channel} with immediate timing is not rescheduled");
            }
        } else {
            info.enable = false;
            // Mirror the disable into the mapped control register.
            let offset = dma_control_offset(channel);
            let raw = self.io.value(offset);
            self.io.set_value(offset, raw & 0x7FE0);
        }
    }

    fn eeprom_dma_hint(&mut self, region: usize, count: u32) {
        if let Slot::Index(slot) = self.resolve_slot(region) {
            if let Region::Save(Backup::Eeprom(eeprom)) = &mut self.regions[slot] {
                eeprom.dma_transfer_hint(count);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dma_transfer(
        &mut self,
        source: u32,
        dest: u32,
        count: u32,
        width: u32,
        source_step: i32,
        dest_step: i32,
        cpu: &mut CpuContext,
    ) {
        if self.dma_block_copy(source, dest, count, width, source_step, dest_step) {
            return;
        }
        if self.dma_view_read_copy(source, dest, count, width, source_step, dest_step, cpu) {
            return;
        }

        let mut source = source;
        let mut dest = dest;
        for _ in 0..count {
            if width == 4 {
                let word = self.load32(source, cpu);
                self.store32(dest, word, cpu);
            } else {
                let half = self.load_u16(source, cpu);
                self.store16(dest, half, cpu);
            }
            source = source.wrapping_add_signed(source_step);
            dest = dest.wrapping_add_signed(dest_step);
        }
    }

    /// Middle tier: only the source is plain RAM. Reads go through the raw
    /// buffer view, stores through the region API of whatever the
    /// destination is.
    #[allow(clippy::too_many_arguments)]
    fn dma_view_read_copy(
        &mut self,
        source: u32,
        dest: u32,
        count: u32,
        width: u32,
        source_step: i32,
        dest_step: i32,
        cpu: &mut CpuContext,
    ) -> bool {
        if source_step != width as i32 {
            return false;
        }
        let src_slot = match self.resolve_slot((source >> BASE_OFFSET) as usize) {
            Slot::Index(slot) => slot,
            _ => return false,
        };

        let len = (count * width) as usize;
        let src_offset = (source & OFFSET_MASK) as usize;
        let in_bounds = matches!(
            self.regions[src_slot].as_ram(),
            Some(block) if src_offset + len <= block.view().len()
        );
        if !in_bounds {
            return false;
        }

        let mut dest = dest;
        for i in 0..count {
            let at = src_offset + (i * width) as usize;
            if width == 4 {
                let view = self.regions[src_slot].as_ram().expect("checked above").view();
                let word = u32::from_le_bytes(view[at..at + 4].try_into().expect("word"));
                self.store32(dest, word, cpu);
            } else {
                let view = self.regions[src_slot].as_ram().expect("checked above").view();
                let half = u16::from_le_bytes([view[at], view[at + 1]]);
                self.store16(dest, half, cpu);
            }
            dest = dest.wrapping_add_signed(dest_step);
        }
        true
    }

    /// Fast path: an incrementing copy between plain RAM blocks goes
    /// through the raw buffer views. Instruction-cache pages over the
    /// destination are invalidated first, since no store sees them.
    fn dma_block_copy(
        &mut self,
        source: u32,
        dest: u32,
        count: u32,
        width: u32,
        source_step: i32,
        dest_step: i32,
    ) -> bool {
        if source_step != width as i32 || dest_step != width as i32 {
            return false;
        }
        let (src_slot, dst_slot) = match (
            self.resolve_slot((source >> BASE_OFFSET) as usize),
            self.resolve_slot((dest >> BASE_OFFSET) as usize),
        ) {
            (Slot::Index(a), Slot::Index(b)) => (a, b),
            _ => return false,
        };

        let len = (count * width) as usize;
        let src_offset = (source & OFFSET_MASK) as usize;
        let dst_offset = (dest & OFFSET_MASK) as usize;

        let src_in_bounds = matches!(
            self.regions[src_slot].as_ram(),
            Some(block) if src_offset + len <= block.view().len()
        );
        let dst_in_bounds = matches!(
            self.regions[dst_slot].as_ram(),
            Some(block) if dst_offset + len <= block.view().len()
        );
        if !src_in_bounds || !dst_in_bounds {
            return false;
        }

        self.invalidate_range(dst_slot, dest & OFFSET_MASK, len);

        if src_slot == dst_slot {
            let block = self.regions[src_slot]
                .as_ram_mut()
                .expect("checked above");
            block
                .view_mut()
                .copy_within(src_offset..src_offset + len, dst_offset);
        } else {
            let (src, dst) = Self::two_regions(&mut self.regions, src_slot, dst_slot);
            let src_block = src.as_ram().expect("checked above");
            let dst_block = dst.as_ram_mut().expect("checked above");
            dst_block.view_mut()[dst_offset..dst_offset + len]
                .copy_from_slice(&src_block.view()[src_offset..src_offset + len]);
        }
        true
    }

    fn two_regions(
        regions: &mut [Region; 16],
        a: usize,
        b: usize,
    ) -> (&mut Region, &mut Region) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = regions.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = regions.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    fn invalidate_range(&mut self, slot: usize, offset: u32, len: usize) {
        if let Some(icache) = self.regions[slot].icache_mut() {
            let page = 1_u32 << icache.page_bits();
            let mut address = offset & !(page - 1);
            while address < offset + len as u32 {
                icache.invalidate(address);
                address += page;
            }
        }
    }

    // ------------------------------------------------------------------
    // Instruction cache
    // ------------------------------------------------------------------

    /// Hands the interpreter the decode page with the given index, creating
    /// it if absent or invalidated.
    pub fn access_page(
        &mut self,
        region: usize,
        page_id: usize,
    ) -> Result<&mut CachePage, IcacheUnavailable> {
        let slot = match self.resolve_slot(region) {
            Slot::Index(slot) => slot,
            Slot::Io | Slot::OpenBus => return Err(IcacheUnavailable { region }),
        };
        match self.regions[slot].icache_mut() {
            Some(icache) => Ok(icache.access_page(page_id)),
            None => Err(IcacheUnavailable { region }),
        }
    }

    // ------------------------------------------------------------------
    // Cartridge and BIOS loading
    // ------------------------------------------------------------------

    pub fn load_bios(&mut self, data: Vec<u8>) {
        self.regions[REGION_BIOS] = Region::Bios(BiosView::new(data, ICACHE_PAGE_BITS_BIOS));
    }

    /// Validates and installs a cartridge image: the ROM views in the three
    /// cartridge windows and the backup inferred from the image. On error
    /// no slot is touched.
    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), CartridgeError> {
        let cart = Cartridge::parse(&data)?;
        let rom = Rc::new(data);

        self.regions[REGION_CART0] = Region::Rom(RomView::new(
            Rc::clone(&rom),
            0,
            ICACHE_PAGE_BITS_ROM,
        ));
        self.regions[REGION_CART1] = Region::Mirror(REGION_CART0);
        self.regions[REGION_CART2] = Region::Mirror(REGION_CART0);

        if rom.len() > CART_HIGH_BASE {
            self.regions[REGION_CART0 + 1] = Region::Rom(RomView::new(
                Rc::clone(&rom),
                CART_HIGH_BASE,
                ICACHE_PAGE_BITS_ROM,
            ));
            self.regions[REGION_CART1 + 1] = Region::Mirror(REGION_CART0 + 1);
            self.regions[REGION_CART2 + 1] = Region::Mirror(REGION_CART0 + 1);
        }

        let (slot, backup) = match cart.save_kind {
            SaveKind::Sram => (REGION_CART_SRAM, Backup::Sram(Sram::new())),
            SaveKind::Flash512 => (
                REGION_CART_SRAM,
                Backup::Flash(Flash::new(FlashSize::Flash512)),
            ),
            SaveKind::Flash1M => (
                REGION_CART_SRAM,
                Backup::Flash(Flash::new(FlashSize::Flash1M)),
            ),
            // The EEPROM answers in the high half of cartridge window 2.
            SaveKind::Eeprom => (REGION_CART2 + 1, Backup::Eeprom(Eeprom::new())),
        };
        self.regions[slot] = Region::Save(backup);
        self.backup_slot = Some(slot);
        self.cart = Some(cart);
        Ok(())
    }

    #[must_use]
    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cart.as_ref()
    }

    #[must_use]
    pub fn backup(&self) -> Option<&Backup> {
        let slot = self.backup_slot?;
        match &self.regions[slot] {
            Region::Save(backup) => Some(backup),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Save flush
    // ------------------------------------------------------------------

    /// Frame-boundary save logic: a dirty backup is noted on one frame and
    /// persisted on the next, once `write_pending` stayed clear for a whole
    /// frame.
    pub fn frame_boundary(&mut self, store: &mut dyn SaveStore) {
        let Some(code) = self.cart.as_ref().map(|cart| cart.game_code.clone()) else {
            return;
        };
        let Some(slot) = self.backup_slot else {
            return;
        };
        let Region::Save(backup) = &mut self.regions[slot] else {
            return;
        };

        if backup.write_pending() {
            backup.clear_write_pending();
            self.save_seen = true;
        } else if self.save_seen {
            self.save_seen = false;
            let encoded = BASE64.encode(backup.view());
            store.save(&code, &encoded);
        }
    }

    /// Pulls previously persisted save data back into the backup.
    pub fn restore_save(&mut self, store: &mut dyn SaveStore) {
        let Some(code) = self.cart.as_ref().map(|cart| cart.game_code.clone()) else {
            return;
        };
        let Some(slot) = self.backup_slot else {
            return;
        };
        let Some(encoded) = store.load(&code) else {
            return;
        };
        match BASE64.decode(encoded) {
            Ok(bytes) => {
                if let Region::Save(backup) = &mut self.regions[slot] {
                    backup.replace_data(&bytes);
                }
            }
            Err(err) => warn!("discarding malformed save data for {code}: {err}"),
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    fn ram_block(&self, slot: usize) -> &MemoryBlock {
        self.regions[slot].as_ram().expect("slot holds a RAM block")
    }

    /// Freezes the core state the snapshot format covers: both work RAM
    /// buffers and the I/O register block.
    #[must_use]
    pub fn freeze(&self) -> Vec<u8> {
        let mut io = self.io.clone();
        io.set_value(IO_IE, self.irq.enable);
        io.set_value(IO_IF, self.irq.flags);
        io.set_value(IO_IME, u16::from(self.irq.master_enable));
        io.set_value(IO_POSTFLG, u16::from(self.irq.post_boot_flag));

        snapshot::serialize(&[
            (
                "ram".into(),
                Node::Blob(self.ram_block(REGION_WORKING_RAM).view().to_vec()),
            ),
            (
                "iram".into(),
                Node::Blob(self.ram_block(REGION_WORKING_IRAM).view().to_vec()),
            ),
            ("io".into(), Node::Blob(io.to_bytes())),
        ])
    }

    /// Restores a [`Self::freeze`] snapshot. The whole stream is validated
    /// before anything is applied; on error the pre-restore state is kept
    /// intact.
    pub fn defrost(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let fields = snapshot::deserialize(bytes)?;

        let blob = |key: &'static str| -> Result<&Vec<u8>, SnapshotError> {
            match snapshot::field(&fields, key)? {
                Node::Blob(bytes) => Ok(bytes),
                _ => Err(SnapshotError::WrongShape(key)),
            }
        };
        let ram = blob("ram")?;
        let iram = blob("iram")?;
        let io = blob("io")?;

        self.regions[REGION_WORKING_RAM].replace_data(ram);
        self.regions[REGION_WORKING_IRAM].replace_data(iram);
        self.io.restore_bytes(io);

        self.irq.enable = self.io.value(IO_IE);
        self.irq.flags = self.io.value(IO_IF);
        self.irq.master_enable = self.io.value(IO_IME) & 1 != 0;
        self.irq.post_boot_flag = self.io.value(IO_POSTFLG) as u8;
        self.waits.adjust_timings(self.io.value(IO_WAITCNT));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::Engine as _;

    use super::*;
    use crate::interrupt::Irq;
    use crate::memory::icache::CachedInstr;

    fn test_rom(save_token: Option<&[u8]>) -> Vec<u8> {
        let mut rom = vec![0_u8; 0x2000];
        rom[0xA0..0xAC].copy_from_slice(b"HELLOWORLD\0\0");
        rom[0xAC..0xB0].copy_from_slice(b"AXVE");
        rom[0xB2] = 0x96;
        if let Some(token) = save_token {
            rom[0x1000..0x1000 + token.len()].copy_from_slice(token);
        }
        rom
    }

    #[derive(Default)]
    struct MapStore(HashMap<String, String>);

    impl SaveStore for MapStore {
        fn save(&mut self, code: &str, data: &str) {
            self.0.insert(code.to_string(), data.to_string());
        }

        fn load(&mut self, code: &str) -> Option<String> {
            self.0.get(code).cloned()
        }
    }

    #[test]
    fn test_rom_load_installs_views_and_default_sram() {
        let mut bus = Bus::default();
        let cpu = CpuContext::default();

        bus.load_rom(test_rom(None)).unwrap();

        let cart = bus.cartridge().unwrap();
        assert_eq!(cart.title, "HELLOWORLD");
        assert_eq!(cart.game_code, "AXVE");

        assert!(matches!(bus.regions[REGION_CART0], Region::Rom(_)));
        assert!(matches!(
            bus.regions[REGION_CART1],
            Region::Mirror(REGION_CART0)
        ));
        assert!(matches!(
            bus.regions[REGION_CART2],
            Region::Mirror(REGION_CART0)
        ));
        assert!(matches!(
            bus.regions[REGION_CART_SRAM],
            Region::Save(Backup::Sram(_))
        ));

        // The same header byte is visible through every window.
        for base in [0x0800_0000_u32, 0x0A00_0000, 0x0C00_0000] {
            assert_eq!(bus.load_u8(base + 0xA0, &cpu), b'H');
        }
    }

    #[test]
    fn test_rom_reject_leaves_slots_untouched() {
        let mut bus = Bus::default();
        let mut rom = test_rom(None);
        rom[0xB2] = 0x00;

        assert!(bus.load_rom(rom).is_err());

        assert!(bus.cartridge().is_none());
        assert!(matches!(bus.regions[REGION_CART0], Region::OpenBus));
        assert!(matches!(bus.regions[REGION_CART_SRAM], Region::OpenBus));
    }

    #[test]
    fn test_eeprom_inferred_and_installed_high() {
        let mut bus = Bus::default();

        bus.load_rom(test_rom(Some(b"EEPROM_V123"))).unwrap();

        assert!(matches!(
            bus.regions[REGION_CART2 + 1],
            Region::Save(Backup::Eeprom(_))
        ));
        assert!(matches!(bus.regions[REGION_CART_SRAM], Region::OpenBus));
    }

    #[test]
    fn test_large_rom_populates_high_slots() {
        let mut rom = test_rom(None);
        rom.resize(0x0100_0100, 0);
        rom[0x0100_0010] = 0x99;

        let mut bus = Bus::default();
        bus.load_rom(rom).unwrap();
        let cpu = CpuContext::default();

        assert_eq!(bus.load_u8(0x0900_0010, &cpu), 0x99);
        assert_eq!(bus.load_u8(0x0B00_0010, &cpu), 0x99);
        assert_eq!(bus.load_u8(0x0D00_0010, &cpu), 0x99);
    }

    #[test]
    fn test_open_bus_duplicates_thumb_prefetch() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext {
            pc: 0x0200_0100,
            exec_mode: ExecMode::Thumb,
            ..Default::default()
        };
        bus.store16(0x0200_00FE, 0xABCD, &mut cpu);

        assert_eq!(bus.load32(0x1000_0000, &cpu), 0xABCD_ABCD);
    }

    #[test]
    fn test_dma_immediate_copy() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        for i in 0..0x40_u32 {
            bus.store8(0x0200_0000 + i, i as u8, &mut cpu);
        }

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0300_0000, &mut cpu);
        bus.store16(0x0400_00DC, 0x10, &mut cpu);
        // 32-bit width, both controls increment, immediate, enable.
        bus.store16(0x0400_00DE, 0x8400, &mut cpu);

        for i in 0..0x40_u32 {
            assert_eq!(bus.load_u8(0x0300_0000 + i, &cpu), i as u8);
        }
        assert_eq!(bus.dma.channels[3].next_count, 0);
        assert!(!bus.dma.channels[3].enable);
        assert_eq!(bus.io.value(0x0DE) & 0x8000, 0);
    }

    #[test]
    fn test_dma_fixed_source_leaves_shadow() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.store32(0x0200_0000, 0x1234_5678, &mut cpu);

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0300_0000, &mut cpu);
        bus.store16(0x0400_00DC, 8, &mut cpu);
        // 32-bit, source fixed, dest increment, immediate, enable.
        bus.store16(0x0400_00DE, 0x8500, &mut cpu);

        assert_eq!(bus.dma.channels[3].next_source, 0x0200_0000);
        for i in 0..8_u32 {
            assert_eq!(bus.load32(0x0300_0000 + i * 4, &cpu), 0x1234_5678);
        }
    }

    #[test]
    fn test_dma_ram_to_backup_goes_through_region_api() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.load_rom(test_rom(Some(b"SRAM_V113"))).unwrap();
        for i in 0..8_u32 {
            bus.store8(0x0200_0000 + i, 0xA0 + i as u8, &mut cpu);
        }

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0E00_0000, &mut cpu);
        bus.store16(0x0400_00DC, 4, &mut cpu);
        bus.store16(0x0400_00DE, 0x8000, &mut cpu);

        for i in 0..8_u32 {
            assert_eq!(bus.load_u8(0x0E00_0000 + i, &cpu), 0xA0 + i as u8);
        }
        // The destination stores went through the backup, which tracked
        // them for the save flush.
        assert!(bus.backup().unwrap().write_pending());
    }

    #[test]
    fn test_dma_repeat_reloads_count_on_vblank() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.store32(0x0400_00B0, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00B4, 0x0300_0000, &mut cpu);
        bus.store16(0x0400_00B8, 8, &mut cpu);
        // 16-bit, repeat, vblank timing, enable.
        bus.store16(0x0400_00BA, 0x9200, &mut cpu);

        // Not serviced until the video event arrives.
        assert_eq!(bus.dma.channels[0].next_count, 8);
        bus.run_vblank_dmas(&mut cpu);

        assert!(bus.dma.channels[0].enable);
        assert_eq!(bus.dma.channels[0].next_count, 8);
        assert_eq!(bus.dma.channels[0].next_source, 0x0200_0000 + 16);
        assert_ne!(bus.io.value(0x0BA) & 0x8000, 0);
    }

    #[test]
    fn test_dma_completion_irq() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0300_0000, &mut cpu);
        bus.store16(0x0400_00DC, 4, &mut cpu);
        // 16-bit, immediate, irq on completion, enable.
        bus.store16(0x0400_00DE, 0xC000, &mut cpu);

        let stamp = bus.dma.channels[3].next_irq.expect("irq queued");
        assert!(stamp > cpu.cycles);

        bus.irq.poll_dma(stamp, &mut bus.dma);
        assert_ne!(bus.irq.flags & Irq::Dma3.mask(), 0);
        assert_eq!(bus.dma.channels[3].next_irq, None);
    }

    #[test]
    fn test_dma_into_unmapped_region_skips_transfer() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0F00_0000, &mut cpu);
        bus.store16(0x0400_00DC, 4, &mut cpu);
        bus.store16(0x0400_00DE, 0x8000, &mut cpu);

        // Bookkeeping still ran: the channel completed and disabled.
        assert!(!bus.dma.channels[3].enable);
        assert_eq!(bus.dma.channels[3].next_count, 0);
    }

    #[test]
    fn test_waitcnt_write_reprograms_tables() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.store16(0x0400_0204, 0x4014, &mut cpu);

        let mut probe = CpuContext::default();
        bus.waits.wait(&mut probe, REGION_CART0);
        assert_eq!(probe.cycles, 4);
        assert_eq!(bus.waits.prefetch(REGION_CART0), 0);
        assert_eq!(bus.io.value(IO_WAITCNT), 0x4014);
    }

    #[test]
    fn test_store_invalidates_icache_page() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.access_page(REGION_WORKING_IRAM, 0).unwrap().thumb[1] = Some(CachedInstr {
            opcode: 0x4770,
            handler: 3,
        });

        bus.store16(0x0300_0002, 0xBEEF, &mut cpu);

        assert!(bus.access_page(REGION_WORKING_IRAM, 0).unwrap().thumb[1].is_none());
    }

    #[test]
    fn test_icache_unavailable_for_io_and_open_bus() {
        let mut bus = Bus::default();

        assert!(bus.access_page(0x4, 0).is_err());
        assert!(bus.access_page(0x1, 0).is_err());
    }

    #[test]
    fn test_if_write_acknowledges() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.irq.raise(Irq::VBlank);
        bus.irq.raise(Irq::Dma0);

        bus.store16(0x0400_0202, Irq::VBlank.mask(), &mut cpu);

        assert_eq!(bus.irq.flags, Irq::Dma0.mask());
    }

    #[test]
    fn test_haltcnt_halts() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();

        bus.store8(0x0400_0301, 0, &mut cpu);

        assert!(bus.irq.halted);
    }

    #[test]
    fn test_save_flush_after_stable_frame() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        let mut store = MapStore::default();
        bus.load_rom(test_rom(Some(b"SRAM_V113"))).unwrap();

        bus.store8(0x0E00_0000, 0x5A, &mut cpu);

        // Dirty at the first boundary: noted, not yet persisted.
        bus.frame_boundary(&mut store);
        assert!(store.0.is_empty());

        // Stable across the next frame: persisted.
        bus.frame_boundary(&mut store);
        let encoded = store.0.get("AXVE").expect("save flushed");
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(bytes[0], 0x5A);

        // And it round-trips into a fresh core.
        let mut other = Bus::default();
        other.load_rom(test_rom(Some(b"SRAM_V113"))).unwrap();
        other.restore_save(&mut store);
        assert_eq!(other.load_u8(0x0E00_0000, &cpu), 0x5A);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.store8(0x0200_0123, 0x42, &mut cpu);
        bus.store32(0x0300_0010, 0xCAFE_F00D, &mut cpu);
        bus.store16(0x0400_0204, 0x4014, &mut cpu);
        bus.store16(0x0400_0200, 0x0109, &mut cpu);

        let snap = bus.freeze();

        let mut other = Bus::default();
        other.defrost(&snap).unwrap();

        assert_eq!(other.load_u8(0x0200_0123, &cpu), 0x42);
        assert_eq!(other.load32(0x0300_0010, &cpu), 0xCAFE_F00D);
        assert_eq!(other.irq.enable, 0x0109);
        assert_eq!(other.io.value(IO_WAITCNT), 0x4014);
        assert_eq!(other.waits.prefetch(REGION_CART0), 0);
    }

    #[test]
    fn test_defrost_failure_keeps_state() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.store8(0x0200_0000, 0x77, &mut cpu);
        let snap = bus.freeze();

        assert!(bus.defrost(&snap[..16]).is_err());
        assert_eq!(bus.load_u8(0x0200_0000, &cpu), 0x77);
    }

    #[test]
    fn test_eeprom_write_and_read_through_dma3() {
        let mut bus = Bus::default();
        let mut cpu = CpuContext::default();
        bus.load_rom(test_rom(Some(b"EEPROM_V123"))).unwrap();

        let address: u32 = 0x10;
        let block: u64 = 0x0123_4567_89AB_CDEF;

        // Compose the 81-bit write request in work RAM, one bit per
        // halfword.
        let mut bits: Vec<u16> = vec![1, 0];
        bits.extend((0..14).rev().map(|i| (address >> i & 1) as u16));
        bits.extend((0..64).rev().map(|i| (block >> i & 1) as u16));
        bits.push(0);
        for (i, bit) in bits.iter().enumerate() {
            bus.store16(0x0200_0000 + i as u32 * 2, *bit, &mut cpu);
        }

        bus.store32(0x0400_00D4, 0x0200_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0D00_0000, &mut cpu);
        bus.store16(0x0400_00DC, bits.len() as u16, &mut cpu);
        bus.store16(0x0400_00DE, 0x8000, &mut cpu);

        assert!(bus.backup().unwrap().write_pending());

        // 17-bit read request.
        let mut request: Vec<u16> = vec![1, 1];
        request.extend((0..14).rev().map(|i| (address >> i & 1) as u16));
        request.push(0);
        for (i, bit) in request.iter().enumerate() {
            bus.store16(0x0200_0400 + i as u32 * 2, *bit, &mut cpu);
        }
        bus.store32(0x0400_00D4, 0x0200_0400, &mut cpu);
        bus.store32(0x0400_00D8, 0x0D00_0000, &mut cpu);
        bus.store16(0x0400_00DC, request.len() as u16, &mut cpu);
        bus.store16(0x0400_00DE, 0x8000, &mut cpu);

        // Stream the 68 response bits back out.
        bus.store32(0x0400_00D4, 0x0D00_0000, &mut cpu);
        bus.store32(0x0400_00D8, 0x0200_0800, &mut cpu);
        bus.store16(0x0400_00DC, 68, &mut cpu);
        bus.store16(0x0400_00DE, 0x8000, &mut cpu);

        let mut value: u64 = 0;
        for i in 4..68_u32 {
            let bit = bus.load_u16(0x0200_0800 + i * 2, &cpu) & 1;
            value = value << 1 | u64::from(bit);
        }
        assert_eq!(value, block);
    }
}
