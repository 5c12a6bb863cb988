//! Emulation engine interface.
//!
//! The controller drives an engine through the `Engine` trait only; CPU
//! execution, memory and peripheral models live behind it. Two
//! implementations ship with the crate:
//! - `Z80Engine`: a small reference machine built on `z80emu`
//! - `HeadlessEngine`: a scriptable engine for tests

mod headless;
mod profile;
mod z80;

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::CalcResult;

pub use headless::{HeadlessEngine, HeadlessEngineFactory};
pub use profile::{find_profile, guess_model, HardwareProfile, ProfileFlags, PROFILES};
pub use z80::{keycode, Z80Engine, Z80EngineFactory};

bitflags! {
    /// Conditions that made a bounded step return.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct StopReason: u32 {
        /// An enabled breakpoint matched.
        const BREAKPOINT = 1 << 0;
        /// The device wrote a byte that the host can now read.
        const LINK_READ_BYTE = 1 << 1;
        /// The device is ready to accept another byte from the host.
        const LINK_WRITE_BYTE = 1 << 2;
        /// The link emulation layer faulted.
        const LINK_ERROR = 1 << 3;
        /// The host asked the engine to stop.
        const REQUESTED = 1 << 4;
    }
}

/// Unit in which a step amount is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUnit {
    /// CPU clock cycles (T-states).
    Cycles,
    /// Emulated wall-clock microseconds.
    Microseconds,
}

/// Outcome of a single `Engine::step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub reason: StopReason,
    /// Units of the requested kind left when the step returned.
    /// May be zero or negative once the budget is exhausted.
    pub remaining: i64,
}

/// Lock-free stop request shared between an engine and its controller.
///
/// The engine polls it between instructions, so a stop can be requested
/// while another thread is inside `step`. Requests only latch while the
/// handle is armed for a run; outside a run they are dropped.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    pending: Arc<AtomicU32>,
}

const ARMED: u32 = 1 << 31;

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept requests from now on, discarding anything left over.
    pub fn arm(&self) {
        self.pending.store(ARMED, Ordering::SeqCst);
    }

    /// Stop accepting requests and drop any that were not consumed.
    pub fn disarm(&self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.pending.load(Ordering::SeqCst) & ARMED != 0
    }

    /// Request the current step to end. `REQUESTED` is always added.
    ///
    /// Returns false if no run was armed to receive it.
    pub fn request(&self, reason: StopReason) -> bool {
        let bits = (reason | StopReason::REQUESTED).bits();
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                (word & ARMED != 0).then_some(word | bits)
            })
            .is_ok()
    }

    /// Consume any pending request, staying armed.
    pub fn take(&self) -> StopReason {
        let word = self.pending.fetch_and(ARMED, Ordering::SeqCst);
        StopReason::from_bits_truncate(word & !ARMED)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) & !ARMED != 0
    }
}

/// Identifier allocated by an engine for one of its breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineBreakpointId(pub u32);

impl fmt::Display for EngineBreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of access a breakpoint watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Execution reaching an address.
    Exec,
    MemRead,
    MemWrite,
    PortRead,
    PortWrite,
}

/// Address-range condition of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub kind: BreakpointKind,
    /// Match physical (banked) addresses instead of CPU-visible ones.
    pub physical: bool,
    pub start: u32,
    /// Exclusive end of the range.
    pub end: u32,
    pub mask: u32,
}

impl Default for BreakpointSpec {
    fn default() -> Self {
        Self {
            kind: BreakpointKind::Exec,
            physical: false,
            start: 0,
            end: 0,
            mask: u32::MAX,
        }
    }
}

impl BreakpointSpec {
    /// Execution breakpoint covering `[start, end)`.
    pub fn exec(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: BreakpointKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn physical(mut self, physical: bool) -> Self {
        self.physical = physical;
        self
    }

    /// Whether `addr` falls inside the masked range.
    pub fn contains(&self, addr: u32) -> bool {
        let addr = addr & self.mask;
        self.start <= addr && addr < self.end
    }
}

/// Extra condition evaluated with the matched address; the breakpoint only
/// stops execution when it returns true.
pub type BreakPredicate = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Severity of an engine diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Message,
    Warning,
    Internal,
}

/// Diagnostic emitted by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: LogLevel,
    pub message: String,
    /// Program counter at the time of the report.
    pub pc: u32,
}

type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Per-engine context handed over at creation time.
///
/// Diagnostics flow through it back to whichever controller owns the
/// engine; every report is also written to the `log` facade.
#[derive(Clone, Default)]
pub struct EngineContext {
    sink: Option<DiagnosticSink>,
}

impl EngineContext {
    pub fn new(sink: impl Fn(&Diagnostic) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Context that only logs.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn message(&self, pc: u32, message: impl Into<String>) {
        self.report(LogLevel::Message, pc, message.into());
    }

    pub fn warning(&self, pc: u32, message: impl Into<String>) {
        self.report(LogLevel::Warning, pc, message.into());
    }

    pub fn internal(&self, pc: u32, message: impl Into<String>) {
        self.report(LogLevel::Internal, pc, message.into());
    }

    fn report(&self, level: LogLevel, pc: u32, message: String) {
        match level {
            LogLevel::Message => log::info!("[{:04X}] {}", pc, message),
            LogLevel::Warning => log::warn!("[{:04X}] {}", pc, message),
            LogLevel::Internal => log::error!("[{:04X}] internal error: {}", pc, message),
        }
        if let Some(sink) = &self.sink {
            sink(&Diagnostic { level, message, pc });
        }
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// A steppable calculator emulation engine.
pub trait Engine: Send {
    /// Hardware profile this engine was created for.
    fn profile(&self) -> &'static HardwareProfile;

    /// Load a ROM image and an optional save state.
    fn load_state(&mut self, rom: &mut dyn Read, save: Option<&mut dyn Read>) -> CalcResult<()>;

    /// Write the ROM image and/or the save state.
    fn save_state(
        &mut self,
        rom: Option<&mut dyn Write>,
        save: Option<&mut dyn Write>,
    ) -> CalcResult<()>;

    /// Simulate a battery pull.
    fn reset(&mut self);

    /// Run for up to `amount` units. Stops early on any `StopReason`.
    fn step(&mut self, amount: i64, unit: StepUnit) -> StepResult;

    /// Stop reason accumulated since the last clear or step.
    fn stop_reason(&self) -> StopReason;

    fn clear_stop_reason(&mut self);

    /// Breakpoint that ended the last step, if any.
    fn stop_breakpoint(&self) -> Option<EngineBreakpointId>;

    /// Handle used to interrupt `step` from another thread.
    fn stop_handle(&self) -> StopHandle;

    /// Whether the LCD is powered and showing memory contents.
    fn display_active(&self) -> bool;

    /// Copy the 1bpp display into `frame` (row-major, MSB first).
    fn monochrome_frame(&self, frame: &mut [u8]);

    /// Offer one byte to the device. Returns false if the link is busy.
    fn link_send_byte(&mut self, byte: u8) -> bool;

    /// Take a byte written by the device, if one is pending.
    fn link_get_byte(&mut self) -> Option<u8>;

    fn link_reset(&mut self);

    fn add_breakpoint(
        &mut self,
        spec: BreakpointSpec,
        predicate: Option<BreakPredicate>,
    ) -> EngineBreakpointId;

    /// Release a breakpoint id. Returns false if the id was unknown.
    fn remove_breakpoint(&mut self, id: EngineBreakpointId) -> bool;

    fn breakpoint(&self, id: EngineBreakpointId) -> Option<BreakpointSpec>;

    /// Replace a breakpoint's condition. Returns false if the id was unknown.
    fn update_breakpoint(&mut self, id: EngineBreakpointId, spec: BreakpointSpec) -> bool;

    fn press_key(&mut self, key: u8);

    fn release_key(&mut self, key: u8);
}

/// Creates engines for the hardware profiles it supports.
pub trait EngineFactory: Send + Sync {
    /// Profiles this factory can instantiate.
    fn profiles(&self) -> &'static [HardwareProfile];

    /// Guess the model id of a ROM image. Returns None if undetected.
    fn guess_model(&self, rom: &[u8]) -> Option<&'static str>;

    fn create(
        &self,
        profile: &'static HardwareProfile,
        context: EngineContext,
    ) -> CalcResult<Box<dyn Engine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_adds_requested() {
        let handle = StopHandle::new();
        let shared = handle.clone();
        handle.arm();
        assert!(shared.request(StopReason::BREAKPOINT));

        assert!(handle.is_pending());
        assert_eq!(
            handle.take(),
            StopReason::BREAKPOINT | StopReason::REQUESTED
        );
        assert!(handle.take().is_empty());
        assert!(handle.is_armed());
    }

    #[test]
    fn test_stop_handle_drops_requests_while_disarmed() {
        let handle = StopHandle::new();
        assert!(!handle.request(StopReason::empty()));
        assert!(!handle.is_pending());

        handle.arm();
        handle.request(StopReason::empty());
        handle.disarm();
        assert!(handle.take().is_empty());

        handle.arm();
        handle.request(StopReason::empty());
        handle.arm();
        assert!(!handle.is_pending());
    }

    #[test]
    fn test_breakpoint_range_is_half_open() {
        let spec = BreakpointSpec::exec(0x10, 0x20);
        assert!(!spec.contains(0x0F));
        assert!(spec.contains(0x10));
        assert!(spec.contains(0x1F));
        assert!(!spec.contains(0x20));
    }

    #[test]
    fn test_breakpoint_mask_applies_to_address() {
        let spec = BreakpointSpec {
            mask: 0x3FFF,
            ..BreakpointSpec::exec(0x0100, 0x0101)
        };
        assert!(spec.contains(0x4100));
        assert!(spec.contains(0x8100));
        assert!(!spec.contains(0x4101));
    }

    #[test]
    fn test_default_breakpoint_never_matches() {
        let spec = BreakpointSpec::default();
        assert!(!spec.contains(0));
        assert!(!spec.contains(0xFFFF));
    }

    #[test]
    fn test_context_routes_diagnostics() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let context = EngineContext::new(move |d: &Diagnostic| {
            sink.lock().unwrap().push(d.clone());
        });

        context.warning(0x1234, "link overrun");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, LogLevel::Warning);
        assert_eq!(seen[0].pc, 0x1234);
        assert_eq!(seen[0].message, "link overrun");
    }
}
