//! One loaded engine and everything the controller keeps beside it.

use std::path::{Path, PathBuf};

use crate::breakpoints::{BreakpointHandle, BreakpointTable};
use crate::display::DisplayCompositor;
use crate::engine::{BreakPredicate, BreakpointSpec, Engine, HardwareProfile, StopHandle};
use crate::error::CalcResult;
use crate::link::LinkPortBridge;
use crate::queue::ByteQueue;

/// Engine plus link queues, breakpoints and display buffers.
///
/// The display buffers are sized from the engine's profile when the session
/// is created and never resized.
pub struct Session<E: Engine + ?Sized = dyn Engine> {
    pub(crate) engine: Box<E>,
    pub(crate) input: ByteQueue,
    pub(crate) output: ByteQueue,
    pub(crate) link: LinkPortBridge,
    pub(crate) breakpoints: BreakpointTable,
    display: DisplayCompositor,
    pub(crate) stop_handle: StopHandle,
    rom_path: Option<PathBuf>,
}

impl<E: Engine + ?Sized> Session<E> {
    pub fn new(engine: Box<E>) -> Self {
        let display = DisplayCompositor::new(engine.profile());
        let stop_handle = engine.stop_handle();
        Self {
            engine,
            input: ByteQueue::new(),
            output: ByteQueue::new(),
            link: LinkPortBridge::new(),
            breakpoints: BreakpointTable::new(),
            display,
            stop_handle,
            rom_path: None,
        }
    }

    pub fn with_rom_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rom_path = Some(path.into());
        self
    }

    /// Get a reference to the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Get a mutable reference to the engine.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn profile(&self) -> &'static HardwareProfile {
        self.engine.profile()
    }

    pub fn rom_path(&self) -> Option<&Path> {
        self.rom_path.as_deref()
    }

    /// Handle that interrupts a run without taking any lock.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Host to device bytes not yet accepted by the engine.
    pub fn input(&self) -> &ByteQueue {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut ByteQueue {
        &mut self.input
    }

    /// Device to host bytes not yet read.
    pub fn output(&self) -> &ByteQueue {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut ByteQueue {
        &mut self.output
    }

    pub fn link(&self) -> &LinkPortBridge {
        &self.link
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// Table and engine together, for edits that touch both.
    pub fn breakpoints_mut(&mut self) -> (&mut BreakpointTable, &mut E) {
        (&mut self.breakpoints, &mut *self.engine)
    }

    pub fn add_breakpoint(&mut self, predicate: Option<BreakPredicate>) -> BreakpointHandle {
        self.breakpoints.add(&mut *self.engine, predicate)
    }

    pub fn add_breakpoint_with(
        &mut self,
        spec: BreakpointSpec,
        predicate: Option<BreakPredicate>,
    ) -> BreakpointHandle {
        self.breakpoints.add_with(&mut *self.engine, spec, predicate)
    }

    pub fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> CalcResult<()> {
        self.breakpoints.remove(&mut *self.engine, handle)
    }

    pub fn display(&self) -> &DisplayCompositor {
        &self.display
    }

    /// Fold the current engine frame into the composite.
    pub fn lcd_update(&mut self) -> bool {
        self.display.update(&*self.engine)
    }

    /// Reset the engine. Queued bytes survive; the in-flight link state does not.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.link.release();
    }
}

impl<E: Engine + ?Sized> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.engine.profile().model_id)
            .field("input", &self.input.count())
            .field("output", &self.output.count())
            .field("breakpoints", &self.breakpoints.count())
            .field("rom_path", &self.rom_path)
            .finish()
    }
}
