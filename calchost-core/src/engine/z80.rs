//! Reference engine - a small Z80 machine built on `z80emu`.
//!
//! Memory map:
//! - `0000-3FFF`: ROM page 0
//! - `4000-7FFF`: banked ROM page (port 06)
//! - `8000-FFFF`: 32 KiB RAM; the LCD framebuffer occupies its top bytes
//!
//! I/O ports (low byte of the port address):
//! - `00` link status: bit 0 a host byte is waiting, bit 1 output has room
//! - `01` keypad: write the active-low group mask, read active-low keys
//! - `06` ROM bank select
//! - `08` link data: read takes a host byte, write sends one to the host
//! - `10` LCD control: bit 0 display on, bit 1 keep display on during HALT

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};
use z80emu::host::TsCounter;
use z80emu::{Clock, Cpu, Io, Memory, StkReg16, Z80NMOS};

use super::{
    guess_model, BreakPredicate, BreakpointKind, BreakpointSpec, Engine, EngineBreakpointId,
    EngineContext, EngineFactory, HardwareProfile, StepResult, StepUnit, StopHandle, StopReason,
    PROFILES,
};
use crate::error::{CalcError, CalcResult};

/// Type alias for the clock.
type TsClock = TsCounter<i32>;

const PAGE_SIZE: usize = 0x4000;
const RAM_START: u16 = 0x8000;
const RAM_SIZE: usize = 0x8000;
/// Physical address of RAM, above the largest supported ROM.
const RAM_PHYS_BASE: u32 = 0x20_0000;
const MAX_ROM_SIZE: usize = RAM_PHYS_BASE as usize;
const LINK_INBOUND_CAPACITY: usize = 16;
const LINK_OUTBOUND_CAPACITY: usize = 256;
/// Per-step budget cap, keeps the i32 T-state counter from wrapping.
const MAX_STEP_CYCLES: i64 = 1 << 30;

/// I/O port numbers.
pub mod port {
    pub const LINK_STATUS: u8 = 0x00;
    pub const KEYPAD: u8 = 0x01;
    pub const ROM_BANK: u8 = 0x06;
    pub const LINK_DATA: u8 = 0x08;
    pub const LCD_CONTROL: u8 = 0x10;
}

const STATUS_RX_READY: u8 = 0x01;
const STATUS_TX_READY: u8 = 0x02;
const LCD_ON: u8 = 0x01;
const LCD_POWER_ON_HALT: u8 = 0x02;

/// Key code for the key at `bit` of keypad `group`.
pub fn keycode(group: u8, bit: u8) -> u8 {
    (group & 7) * 8 + (bit & 7)
}

#[derive(Debug, Clone)]
struct Keypad {
    group_mask: u8,
    keys_down: [u8; 8],
}

impl Default for Keypad {
    fn default() -> Self {
        Self {
            group_mask: 0xFF,
            keys_down: [0; 8],
        }
    }
}

impl Keypad {
    fn read(&self) -> u8 {
        let pressed = self
            .keys_down
            .iter()
            .enumerate()
            .filter(|(group, _)| self.group_mask & (1 << group) == 0)
            .fold(0, |acc, (_, keys)| acc | keys);
        !pressed
    }
}

#[derive(Debug, Default)]
struct LinkPort {
    /// Host to device.
    inbound: VecDeque<u8>,
    /// Device to host.
    outbound: VecDeque<u8>,
}

impl LinkPort {
    fn status(&self) -> u8 {
        let mut status = 0;
        if !self.inbound.is_empty() {
            status |= STATUS_RX_READY;
        }
        if self.outbound.len() < LINK_OUTBOUND_CAPACITY {
            status |= STATUS_TX_READY;
        }
        status
    }

    fn clear(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
    }
}

/// Memory and peripherals.
struct Hardware {
    rom: Vec<u8>,
    ram: Vec<u8>,
    rom_bank: u8,
    flash_writable: bool,
    keypad: Keypad,
    link: LinkPort,
    lcd_on: bool,
    power_on_halt: bool,
}

impl Hardware {
    fn pages(&self) -> usize {
        (self.rom.len() / PAGE_SIZE).max(1)
    }

    fn physical(&self, addr: u16) -> u32 {
        match addr {
            0x0000..=0x3FFF => addr as u32,
            0x4000..=0x7FFF => self.rom_bank as u32 * PAGE_SIZE as u32 + (addr as u32 - 0x4000),
            _ => RAM_PHYS_BASE + (addr - RAM_START) as u32,
        }
    }

    fn read(&self, addr: u16) -> u8 {
        if addr >= RAM_START {
            self.ram[(addr - RAM_START) as usize]
        } else {
            self.rom
                .get(self.physical(addr) as usize)
                .copied()
                .unwrap_or(0xFF)
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        if addr >= RAM_START {
            self.ram[(addr - RAM_START) as usize] = value;
        } else if self.flash_writable {
            let phys = self.physical(addr) as usize;
            if let Some(byte) = self.rom.get_mut(phys) {
                *byte = value;
            }
        }
    }

    fn lcd_control(&self) -> u8 {
        let mut value = 0;
        if self.lcd_on {
            value |= LCD_ON;
        }
        if self.power_on_halt {
            value |= LCD_POWER_ON_HALT;
        }
        value
    }
}

struct Breakpoint {
    spec: BreakpointSpec,
    predicate: Option<BreakPredicate>,
}

#[derive(Default)]
struct BreakpointSet {
    entries: BTreeMap<EngineBreakpointId, Breakpoint>,
}

impl BreakpointSet {
    /// First breakpoint of `kind` matching either address form.
    fn find(&self, kind: BreakpointKind, virt: u32, phys: u32) -> Option<EngineBreakpointId> {
        self.entries.iter().find_map(|(&id, bp)| {
            if bp.spec.kind != kind {
                return None;
            }
            let addr = if bp.spec.physical { phys } else { virt };
            let fires = bp.spec.contains(addr) && bp.predicate.as_ref().map_or(true, |p| p(addr));
            fires.then_some(id)
        })
    }
}

/// CPU-facing bus for one instruction.
struct Bus<'a> {
    hw: &'a mut Hardware,
    breakpoints: &'a BreakpointSet,
    context: &'a EngineContext,
    pc: u16,
    hit: Cell<Option<EngineBreakpointId>>,
    link_events: StopReason,
}

impl Bus<'_> {
    fn check_mem(&self, kind: BreakpointKind, addr: u16) {
        if self.hit.get().is_none() {
            let phys = self.hw.physical(addr);
            if let Some(id) = self.breakpoints.find(kind, addr as u32, phys) {
                self.hit.set(Some(id));
            }
        }
    }

    fn check_port(&self, kind: BreakpointKind, port: u8) {
        if self.hit.get().is_none() {
            if let Some(id) = self.breakpoints.find(kind, port as u32, port as u32) {
                self.hit.set(Some(id));
            }
        }
    }
}

impl Memory for Bus<'_> {
    type Timestamp = i32;

    fn read_debug(&self, addr: u16) -> u8 {
        self.hw.read(addr)
    }

    fn read_mem(&self, addr: u16, _ts: Self::Timestamp) -> u8 {
        self.check_mem(BreakpointKind::MemRead, addr);
        self.hw.read(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8, _ts: Self::Timestamp) {
        self.check_mem(BreakpointKind::MemWrite, addr);
        self.hw.write(addr, value);
    }
}

impl Io for Bus<'_> {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, port: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        let port = port as u8;
        self.check_port(BreakpointKind::PortRead, port);

        let value = match port {
            port::LINK_STATUS => self.hw.link.status(),
            port::KEYPAD => self.hw.keypad.read(),
            port::ROM_BANK => self.hw.rom_bank,
            port::LINK_DATA => match self.hw.link.inbound.pop_front() {
                Some(byte) => {
                    if self.hw.link.inbound.is_empty() {
                        self.link_events |= StopReason::LINK_WRITE_BYTE;
                    }
                    byte
                }
                None => 0x00,
            },
            port::LCD_CONTROL => self.hw.lcd_control(),
            _ => 0xFF,
        };
        (value, None)
    }

    fn write_io(
        &mut self,
        port: u16,
        value: u8,
        _ts: Self::Timestamp,
    ) -> (Option<Self::WrIoBreak>, Option<NonZeroU16>) {
        let port = port as u8;
        self.check_port(BreakpointKind::PortWrite, port);

        match port {
            port::KEYPAD => self.hw.keypad.group_mask = value,
            port::ROM_BANK => {
                let pages = self.hw.pages();
                if value as usize >= pages {
                    self.context.warning(
                        self.pc as u32,
                        format!("ROM page {:02X} out of range ({} pages)", value, pages),
                    );
                }
                self.hw.rom_bank = (value as usize % pages) as u8;
            }
            port::LINK_DATA => {
                if self.hw.link.outbound.len() >= LINK_OUTBOUND_CAPACITY {
                    self.context.warning(self.pc as u32, "link output overrun");
                    self.link_events |= StopReason::LINK_ERROR;
                } else {
                    self.hw.link.outbound.push_back(value);
                    self.link_events |= StopReason::LINK_READ_BYTE;
                }
            }
            port::LCD_CONTROL => {
                self.hw.lcd_on = value & LCD_ON != 0;
                self.hw.power_on_halt = value & LCD_POWER_ON_HALT != 0;
            }
            _ => {}
        }
        (None, None)
    }
}

/// CPU registers persisted in a save state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Registers {
    af: u16,
    bc: u16,
    de: u16,
    hl: u16,
    sp: u16,
    pc: u16,
}

/// Human-readable machine state (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveState {
    model: String,
    registers: Registers,
    rom_bank: u8,
    lcd_on: bool,
    power_on_halt: bool,
    keypad_mask: u8,
    #[serde(default)]
    link_inbound: Vec<u8>,
    #[serde(default)]
    link_outbound: Vec<u8>,
    ram: Vec<u8>,
}

/// Z80 reference machine.
pub struct Z80Engine {
    profile: &'static HardwareProfile,
    context: EngineContext,
    cpu: Z80NMOS,
    hw: Hardware,
    breakpoints: BreakpointSet,
    next_breakpoint_id: u32,
    stop_reason: StopReason,
    stop_breakpoint: Option<EngineBreakpointId>,
    stop_handle: StopHandle,
    cycles: u64,
}

impl Z80Engine {
    /// Create an engine with an erased (all 0xFF) ROM.
    pub fn new(profile: &'static HardwareProfile, context: EngineContext) -> Self {
        let mut engine = Self {
            profile,
            context,
            cpu: Z80NMOS::default(),
            hw: Hardware {
                rom: vec![0xFF; profile.rom_size.max(PAGE_SIZE)],
                ram: vec![0; RAM_SIZE],
                rom_bank: 0,
                flash_writable: profile.has_flash(),
                keypad: Keypad::default(),
                link: LinkPort::default(),
                lcd_on: true,
                power_on_halt: true,
            },
            breakpoints: BreakpointSet::default(),
            next_breakpoint_id: 1,
            stop_reason: StopReason::empty(),
            stop_breakpoint: None,
            stop_handle: StopHandle::new(),
            cycles: 0,
        };
        engine.reset();
        engine
    }

    /// Create an engine and load `rom` without a save state.
    pub fn with_rom(profile: &'static HardwareProfile, rom: &[u8]) -> CalcResult<Self> {
        let mut engine = Self::new(profile, EngineContext::detached());
        engine.load_state(&mut &rom[..], None)?;
        Ok(engine)
    }

    /// Address of the first framebuffer byte.
    pub fn lcd_base(&self) -> u16 {
        (0x1_0000 - self.profile.frame_bytes()) as u16
    }

    /// Read CPU-visible memory without side effects.
    pub fn read_memory(&self, addr: u16) -> u8 {
        self.hw.read(addr)
    }

    /// Physical address of a CPU-visible address under the current banking.
    pub fn physical_address(&self, addr: u16) -> u32 {
        self.hw.physical(addr)
    }

    pub fn pc(&self) -> u16 {
        self.cpu.get_pc()
    }

    /// Total T-states executed since creation.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn exec_hit(&self) -> Option<EngineBreakpointId> {
        let pc = self.cpu.get_pc();
        self.breakpoints
            .find(BreakpointKind::Exec, pc as u32, self.hw.physical(pc))
    }

    fn snapshot(&self) -> SaveState {
        SaveState {
            model: self.profile.model_id.to_string(),
            registers: Registers {
                af: self.cpu.get_reg16(StkReg16::AF),
                bc: self.cpu.get_reg16(StkReg16::BC),
                de: self.cpu.get_reg16(StkReg16::DE),
                hl: self.cpu.get_reg16(StkReg16::HL),
                sp: self.cpu.get_sp(),
                pc: self.cpu.get_pc(),
            },
            rom_bank: self.hw.rom_bank,
            lcd_on: self.hw.lcd_on,
            power_on_halt: self.hw.power_on_halt,
            keypad_mask: self.hw.keypad.group_mask,
            link_inbound: self.hw.link.inbound.iter().copied().collect(),
            link_outbound: self.hw.link.outbound.iter().copied().collect(),
            ram: self.hw.ram.clone(),
        }
    }

    fn restore(&mut self, state: SaveState) -> CalcResult<()> {
        if !state.model.eq_ignore_ascii_case(self.profile.model_id) {
            return Err(CalcError::InvalidState(format!(
                "state is for model {}, engine is {}",
                state.model, self.profile.model_id
            )));
        }
        if state.ram.len() != RAM_SIZE {
            return Err(CalcError::InvalidState(format!(
                "expected {} bytes of RAM, found {}",
                RAM_SIZE,
                state.ram.len()
            )));
        }

        let regs = &state.registers;
        self.cpu.set_reg16(StkReg16::AF, regs.af);
        self.cpu.set_reg16(StkReg16::BC, regs.bc);
        self.cpu.set_reg16(StkReg16::DE, regs.de);
        self.cpu.set_reg16(StkReg16::HL, regs.hl);
        self.cpu.set_sp(regs.sp);
        self.cpu.set_pc(regs.pc);

        self.hw.rom_bank = (state.rom_bank as usize % self.hw.pages()) as u8;
        self.hw.lcd_on = state.lcd_on;
        self.hw.power_on_halt = state.power_on_halt;
        self.hw.keypad.group_mask = state.keypad_mask;
        self.hw.link.inbound = state.link_inbound.into();
        self.hw.link.outbound = state.link_outbound.into();
        self.hw.ram = state.ram;
        Ok(())
    }
}

impl Engine for Z80Engine {
    fn profile(&self) -> &'static HardwareProfile {
        self.profile
    }

    fn load_state(&mut self, rom: &mut dyn Read, save: Option<&mut dyn Read>) -> CalcResult<()> {
        let mut image = Vec::new();
        rom.read_to_end(&mut image)?;
        if image.is_empty() {
            return Err(CalcError::InvalidRom("empty ROM image".to_string()));
        }
        if image.len() > MAX_ROM_SIZE {
            return Err(CalcError::InvalidRom(format!(
                "ROM image of {} bytes exceeds {} bytes",
                image.len(),
                MAX_ROM_SIZE
            )));
        }
        if image.len() != self.profile.rom_size {
            self.context.message(
                0,
                format!(
                    "ROM is {} bytes, {} expects {}",
                    image.len(),
                    self.profile.description,
                    self.profile.rom_size
                ),
            );
        }

        let padded = image.len().div_ceil(PAGE_SIZE) * PAGE_SIZE;
        image.resize(padded, 0xFF);
        self.hw.rom = image;
        self.reset();

        if let Some(save) = save {
            let state: SaveState = serde_json::from_reader(save)?;
            self.restore(state)?;
        }
        Ok(())
    }

    fn save_state(
        &mut self,
        rom: Option<&mut dyn Write>,
        save: Option<&mut dyn Write>,
    ) -> CalcResult<()> {
        if let Some(rom) = rom {
            rom.write_all(&self.hw.rom)?;
        }
        if let Some(save) = save {
            serde_json::to_writer_pretty(&mut *save, &self.snapshot())?;
            save.write_all(b"\n")?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        let keys = self.hw.keypad.keys_down;

        self.cpu.reset();
        self.hw.ram.fill(0);
        self.hw.rom_bank = 0;
        self.hw.keypad = Keypad {
            keys_down: keys,
            ..Keypad::default()
        };
        self.hw.link.clear();
        self.hw.lcd_on = true;
        self.hw.power_on_halt = true;
        self.cpu.set_sp(self.lcd_base());
        self.stop_reason = StopReason::empty();
        self.stop_breakpoint = None;
    }

    fn step(&mut self, amount: i64, unit: StepUnit) -> StepResult {
        self.stop_reason = StopReason::empty();
        self.stop_breakpoint = None;

        let rate = self.profile.clock_mhz.max(1) as i64;
        let budget = match unit {
            StepUnit::Cycles => amount,
            StepUnit::Microseconds => amount.saturating_mul(rate),
        }
        .min(MAX_STEP_CYCLES);

        let mut clock = TsClock::default();
        let mut reason = StopReason::empty();

        while (clock.as_timestamp() as i64) < budget {
            let requested = self.stop_handle.take();
            if !requested.is_empty() {
                reason |= requested;
                break;
            }

            let mut bus = Bus {
                hw: &mut self.hw,
                breakpoints: &self.breakpoints,
                context: &self.context,
                pc: self.cpu.get_pc(),
                hit: Cell::new(None),
                link_events: StopReason::empty(),
            };
            let _result =
                self.cpu
                    .execute_next(&mut bus, &mut clock, None::<fn(z80emu::CpuDebug)>);
            let hit = bus.hit.get();
            let link_events = bus.link_events;

            if let Some(id) = hit.or_else(|| self.exec_hit()) {
                self.stop_breakpoint = Some(id);
                reason |= StopReason::BREAKPOINT;
            }
            reason |= link_events;
            if !reason.is_empty() {
                break;
            }
        }

        let elapsed = clock.as_timestamp() as i64;
        self.cycles += elapsed.max(0) as u64;
        let left = budget - elapsed;
        self.stop_reason |= reason;

        StepResult {
            reason: self.stop_reason,
            remaining: match unit {
                StepUnit::Cycles => left,
                StepUnit::Microseconds => left / rate,
            },
        }
    }

    fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    fn clear_stop_reason(&mut self) {
        self.stop_reason = StopReason::empty();
    }

    fn stop_breakpoint(&self) -> Option<EngineBreakpointId> {
        self.stop_breakpoint
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    fn display_active(&self) -> bool {
        self.hw.lcd_on && !(self.cpu.is_halt() && !self.hw.power_on_halt)
    }

    fn monochrome_frame(&self, frame: &mut [u8]) {
        let start = (self.lcd_base() - RAM_START) as usize;
        let len = frame.len().min(self.profile.frame_bytes());
        frame[..len].copy_from_slice(&self.hw.ram[start..start + len]);
    }

    fn link_send_byte(&mut self, byte: u8) -> bool {
        let inbound = &mut self.hw.link.inbound;
        if inbound.len() >= LINK_INBOUND_CAPACITY {
            return false;
        }
        inbound.push_back(byte);
        if inbound.len() < LINK_INBOUND_CAPACITY {
            self.stop_reason |= StopReason::LINK_WRITE_BYTE;
        }
        true
    }

    fn link_get_byte(&mut self) -> Option<u8> {
        self.hw.link.outbound.pop_front()
    }

    fn link_reset(&mut self) {
        self.hw.link.clear();
    }

    fn add_breakpoint(
        &mut self,
        spec: BreakpointSpec,
        predicate: Option<BreakPredicate>,
    ) -> EngineBreakpointId {
        let id = loop {
            let id = EngineBreakpointId(self.next_breakpoint_id);
            self.next_breakpoint_id = self.next_breakpoint_id.wrapping_add(1).max(1);
            if !self.breakpoints.entries.contains_key(&id) {
                break id;
            }
        };
        self.breakpoints
            .entries
            .insert(id, Breakpoint { spec, predicate });
        id
    }

    fn remove_breakpoint(&mut self, id: EngineBreakpointId) -> bool {
        self.breakpoints.entries.remove(&id).is_some()
    }

    fn breakpoint(&self, id: EngineBreakpointId) -> Option<BreakpointSpec> {
        self.breakpoints.entries.get(&id).map(|bp| bp.spec)
    }

    fn update_breakpoint(&mut self, id: EngineBreakpointId, spec: BreakpointSpec) -> bool {
        match self.breakpoints.entries.get_mut(&id) {
            Some(bp) => {
                bp.spec = spec;
                true
            }
            None => false,
        }
    }

    fn press_key(&mut self, key: u8) {
        if let Some(group) = self.hw.keypad.keys_down.get_mut((key / 8) as usize) {
            *group |= 1 << (key % 8);
        }
    }

    fn release_key(&mut self, key: u8) {
        if let Some(group) = self.hw.keypad.keys_down.get_mut((key / 8) as usize) {
            *group &= !(1 << (key % 8));
        }
    }
}

/// Factory for `Z80Engine`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Z80EngineFactory;

impl EngineFactory for Z80EngineFactory {
    fn profiles(&self) -> &'static [HardwareProfile] {
        &PROFILES
    }

    fn guess_model(&self, rom: &[u8]) -> Option<&'static str> {
        guess_model(rom)
    }

    fn create(
        &self,
        profile: &'static HardwareProfile,
        context: EngineContext,
    ) -> CalcResult<Box<dyn Engine>> {
        Ok(Box::new(Z80Engine::new(profile, context)))
    }
}
