//! Controller-side breakpoint bookkeeping.
//!
//! Callers refer to breakpoints by `BreakpointHandle`, which stays valid
//! until removed. Each handle owns exactly one engine breakpoint; the
//! table maps between the two and forwards field edits to the engine.

use std::collections::BTreeMap;
use std::fmt;

use crate::engine::{BreakPredicate, BreakpointKind, BreakpointSpec, Engine, EngineBreakpointId};
use crate::error::{CalcError, CalcResult};

/// Stable caller-facing breakpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointHandle(u32);

impl BreakpointHandle {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BreakpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp{}", self.0)
    }
}

/// Handle to engine-id mapping for one session.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: BTreeMap<BreakpointHandle, EngineBreakpointId>,
    next_handle: u32,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an execution breakpoint with an empty range.
    pub fn add<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        predicate: Option<BreakPredicate>,
    ) -> BreakpointHandle {
        self.add_with(engine, BreakpointSpec::default(), predicate)
    }

    /// Create a breakpoint with the given condition.
    pub fn add_with<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        spec: BreakpointSpec,
        predicate: Option<BreakPredicate>,
    ) -> BreakpointHandle {
        let engine_id = engine.add_breakpoint(spec, predicate);
        let handle = self.allocate_handle();
        self.entries.insert(handle, engine_id);
        log::debug!("added breakpoint {} -> engine {}", handle, engine_id);
        handle
    }

    // Handles wrap around, skipping zero and any still in use.
    fn allocate_handle(&mut self) -> BreakpointHandle {
        loop {
            self.next_handle = self.next_handle.wrapping_add(1);
            let handle = BreakpointHandle(self.next_handle);
            if self.next_handle != 0 && !self.entries.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Release the engine breakpoint and forget the handle.
    pub fn remove<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        handle: BreakpointHandle,
    ) -> CalcResult<()> {
        let engine_id = self
            .entries
            .remove(&handle)
            .ok_or(CalcError::UnknownBreakpoint(handle))?;
        if !engine.remove_breakpoint(engine_id) {
            log::warn!("engine had no breakpoint {} for {}", engine_id, handle);
        }
        Ok(())
    }

    /// Forget every handle, releasing the engine breakpoints.
    pub fn clear<E: Engine + ?Sized>(&mut self, engine: &mut E) {
        for (_, engine_id) in std::mem::take(&mut self.entries) {
            engine.remove_breakpoint(engine_id);
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn handles(&self) -> Vec<BreakpointHandle> {
        self.entries.keys().copied().collect()
    }

    pub fn engine_id(&self, handle: BreakpointHandle) -> CalcResult<EngineBreakpointId> {
        self.entries
            .get(&handle)
            .copied()
            .ok_or(CalcError::UnknownBreakpoint(handle))
    }

    /// Reverse lookup, used to resolve the breakpoint that stopped a run.
    pub fn handle_for(&self, engine_id: EngineBreakpointId) -> Option<BreakpointHandle> {
        self.entries
            .iter()
            .find(|(_, &id)| id == engine_id)
            .map(|(&handle, _)| handle)
    }

    /// Full condition of a breakpoint.
    pub fn spec<E: Engine + ?Sized>(
        &self,
        engine: &E,
        handle: BreakpointHandle,
    ) -> CalcResult<BreakpointSpec> {
        let engine_id = self.engine_id(handle)?;
        engine
            .breakpoint(engine_id)
            .ok_or(CalcError::UnknownBreakpoint(handle))
    }

    fn modify<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        edit: impl FnOnce(&mut BreakpointSpec),
    ) -> CalcResult<()> {
        let engine_id = self.engine_id(handle)?;
        let mut spec = engine
            .breakpoint(engine_id)
            .ok_or(CalcError::UnknownBreakpoint(handle))?;
        edit(&mut spec);
        if engine.update_breakpoint(engine_id, spec) {
            Ok(())
        } else {
            Err(CalcError::UnknownBreakpoint(handle))
        }
    }

    pub fn kind<E: Engine + ?Sized>(
        &self,
        engine: &E,
        handle: BreakpointHandle,
    ) -> CalcResult<BreakpointKind> {
        Ok(self.spec(engine, handle)?.kind)
    }

    pub fn set_kind<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        kind: BreakpointKind,
    ) -> CalcResult<()> {
        self.modify(engine, handle, |spec| spec.kind = kind)
    }

    pub fn is_physical<E: Engine + ?Sized>(
        &self,
        engine: &E,
        handle: BreakpointHandle,
    ) -> CalcResult<bool> {
        Ok(self.spec(engine, handle)?.physical)
    }

    pub fn set_physical<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        physical: bool,
    ) -> CalcResult<()> {
        self.modify(engine, handle, |spec| spec.physical = physical)
    }

    pub fn start<E: Engine + ?Sized>(
        &self,
        engine: &E,
        handle: BreakpointHandle,
    ) -> CalcResult<u32> {
        Ok(self.spec(engine, handle)?.start)
    }

    pub fn set_start<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        start: u32,
    ) -> CalcResult<()> {
        self.modify(engine, handle, |spec| spec.start = start)
    }

    /// Exclusive end of the range.
    pub fn end<E: Engine + ?Sized>(&self, engine: &E, handle: BreakpointHandle) -> CalcResult<u32> {
        Ok(self.spec(engine, handle)?.end)
    }

    pub fn set_end<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        end: u32,
    ) -> CalcResult<()> {
        self.modify(engine, handle, |spec| spec.end = end)
    }

    pub fn mask<E: Engine + ?Sized>(
        &self,
        engine: &E,
        handle: BreakpointHandle,
    ) -> CalcResult<u32> {
        Ok(self.spec(engine, handle)?.mask)
    }

    pub fn set_mask<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        handle: BreakpointHandle,
        mask: u32,
    ) -> CalcResult<()> {
        self.modify(engine, handle, |spec| spec.mask = mask)
    }
}
