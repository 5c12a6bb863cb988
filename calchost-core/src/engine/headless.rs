//! Scriptable engine for tests.
//!
//! Models just enough of a device to exercise the controller: a link that
//! accepts a configurable number of bytes per step, scheduled breakpoint
//! hits and link faults, live breakpoint bookkeeping and a settable frame.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};

use super::{
    find_profile, BreakPredicate, BreakpointSpec, Engine, EngineBreakpointId, EngineContext,
    EngineFactory, HardwareProfile, StepResult, StepUnit, StopHandle, StopReason, PROFILES,
};
use crate::error::{CalcError, CalcResult};

/// In-memory engine whose behaviour is driven by the test.
#[derive(Debug)]
pub struct HeadlessEngine {
    profile: &'static HardwareProfile,
    context: EngineContext,
    rom: Vec<u8>,
    /// Bytes offered by the host, not yet consumed by the "device".
    inbound: VecDeque<u8>,
    /// How many inbound bytes the link buffers before reporting busy.
    link_capacity: usize,
    /// Bytes the device consumed, in order.
    received: Vec<u8>,
    /// Bytes waiting to be read by the host.
    outbound: VecDeque<u8>,
    frame: Vec<u8>,
    display_active: bool,
    keys_down: Vec<u8>,
    breakpoints: BTreeMap<EngineBreakpointId, BreakpointSpec>,
    next_breakpoint_id: u32,
    scheduled_break: Option<(u64, EngineBreakpointId)>,
    link_fault: bool,
    stop_reason: StopReason,
    stop_breakpoint: Option<EngineBreakpointId>,
    stop_handle: StopHandle,
    elapsed: u64,
    step_calls: usize,
    link_resets: usize,
    resets: usize,
}

impl HeadlessEngine {
    /// Create an engine for `profile` whose link buffers a single byte.
    pub fn new(profile: &'static HardwareProfile) -> Self {
        Self {
            profile,
            context: EngineContext::detached(),
            rom: Vec::new(),
            inbound: VecDeque::new(),
            link_capacity: 1,
            received: Vec::new(),
            outbound: VecDeque::new(),
            frame: vec![0; profile.frame_bytes()],
            display_active: true,
            keys_down: Vec::new(),
            breakpoints: BTreeMap::new(),
            next_breakpoint_id: 1,
            scheduled_break: None,
            link_fault: false,
            stop_reason: StopReason::empty(),
            stop_breakpoint: None,
            stop_handle: StopHandle::new(),
            elapsed: 0,
            step_calls: 0,
            link_resets: 0,
            resets: 0,
        }
    }

    /// Engine for the TI-83 profile.
    pub fn ti83() -> Self {
        Self::new(&PROFILES[1])
    }

    pub fn with_context(mut self, context: EngineContext) -> Self {
        self.context = context;
        self
    }

    /// Number of bytes the link accepts before a step must drain it.
    /// `usize::MAX` makes the link always signal that it wants more.
    pub fn with_link_capacity(mut self, capacity: usize) -> Self {
        self.link_capacity = capacity.max(1);
        self
    }

    /// Queue bytes the device will write to the host.
    pub fn queue_device_output(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes.iter().copied());
    }

    /// Make the step that reaches `after` elapsed units stop on `id`.
    pub fn schedule_breakpoint(&mut self, after: u64, id: EngineBreakpointId) {
        self.scheduled_break = Some((after, id));
    }

    /// Make the next step report a link fault.
    pub fn fail_link(&mut self) {
        self.link_fault = true;
    }

    pub fn set_frame(&mut self, frame: &[u8]) {
        let len = frame.len().min(self.frame.len());
        self.frame[..len].copy_from_slice(&frame[..len]);
    }

    pub fn set_display_active(&mut self, active: bool) {
        self.display_active = active;
    }

    /// Bytes consumed by the device so far.
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Bytes accepted by the link but not yet consumed.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Total units consumed by steps.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn step_calls(&self) -> usize {
        self.step_calls
    }

    pub fn link_resets(&self) -> usize {
        self.link_resets
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn keys_down(&self) -> &[u8] {
        &self.keys_down
    }

    /// Breakpoint ids currently allocated.
    pub fn live_breakpoints(&self) -> Vec<EngineBreakpointId> {
        self.breakpoints.keys().copied().collect()
    }

    fn finish(&mut self, reason: StopReason, remaining: i64) -> StepResult {
        self.stop_reason |= reason;
        StepResult {
            reason: self.stop_reason,
            remaining,
        }
    }
}

impl Engine for HeadlessEngine {
    fn profile(&self) -> &'static HardwareProfile {
        self.profile
    }

    fn load_state(&mut self, rom: &mut dyn Read, save: Option<&mut dyn Read>) -> CalcResult<()> {
        let mut image = Vec::new();
        rom.read_to_end(&mut image)?;
        if image.is_empty() {
            return Err(CalcError::InvalidRom("empty ROM image".to_string()));
        }
        if let Some(save) = save {
            let mut state = Vec::new();
            save.read_to_end(&mut state)?;
        }
        self.rom = image;
        Ok(())
    }

    fn save_state(
        &mut self,
        rom: Option<&mut dyn Write>,
        save: Option<&mut dyn Write>,
    ) -> CalcResult<()> {
        if let Some(rom) = rom {
            rom.write_all(&self.rom)?;
        }
        if let Some(save) = save {
            writeln!(save, "elapsed = {}", self.elapsed)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.inbound.clear();
        self.outbound.clear();
        self.elapsed = 0;
    }

    fn step(&mut self, amount: i64, _unit: StepUnit) -> StepResult {
        self.step_calls += 1;
        self.stop_reason = StopReason::empty();
        self.stop_breakpoint = None;

        let requested = self.stop_handle.take();
        if !requested.is_empty() {
            return self.finish(requested, amount);
        }

        if self.link_fault {
            self.link_fault = false;
            self.context.warning(0, "link fault");
            return self.finish(StopReason::LINK_ERROR, amount);
        }

        // The device drains the link in one unit and asks for more.
        if !self.inbound.is_empty() {
            self.received.extend(self.inbound.drain(..));
            let used = amount.clamp(0, 1);
            self.elapsed += used as u64;
            return self.finish(StopReason::LINK_WRITE_BYTE, amount - used);
        }

        let budget = amount.max(0) as u64;
        if let Some((at, id)) = self.scheduled_break {
            if self.elapsed + budget >= at {
                let used = at.saturating_sub(self.elapsed);
                self.elapsed += used;
                self.scheduled_break = None;
                self.stop_breakpoint = Some(id);
                return self.finish(StopReason::BREAKPOINT, amount - used as i64);
            }
        }

        self.elapsed += budget;
        self.finish(StopReason::empty(), amount - budget as i64)
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
        self.display_active
    }

    fn monochrome_frame(&self, frame: &mut [u8]) {
        let len = frame.len().min(self.frame.len());
        frame[..len].copy_from_slice(&self.frame[..len]);
    }

    fn link_send_byte(&mut self, byte: u8) -> bool {
        if self.inbound.len() >= self.link_capacity {
            return false;
        }
        self.inbound.push_back(byte);
        if self.inbound.len() < self.link_capacity {
            self.stop_reason |= StopReason::LINK_WRITE_BYTE;
        }
        true
    }

    fn link_get_byte(&mut self) -> Option<u8> {
        self.outbound.pop_front()
    }

    fn link_reset(&mut self) {
        self.link_resets += 1;
        self.inbound.clear();
    }

    fn add_breakpoint(
        &mut self,
        spec: BreakpointSpec,
        _predicate: Option<BreakPredicate>,
    ) -> EngineBreakpointId {
        let id = loop {
            let id = EngineBreakpointId(self.next_breakpoint_id);
            self.next_breakpoint_id = self.next_breakpoint_id.wrapping_add(1).max(1);
            if !self.breakpoints.contains_key(&id) {
                break id;
            }
        };
        self.breakpoints.insert(id, spec);
        id
    }

    fn remove_breakpoint(&mut self, id: EngineBreakpointId) -> bool {
        self.breakpoints.remove(&id).is_some()
    }

    fn breakpoint(&self, id: EngineBreakpointId) -> Option<BreakpointSpec> {
        self.breakpoints.get(&id).copied()
    }

    fn update_breakpoint(&mut self, id: EngineBreakpointId, spec: BreakpointSpec) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(existing) => {
                *existing = spec;
                true
            }
            None => false,
        }
    }

    fn press_key(&mut self, key: u8) {
        if !self.keys_down.contains(&key) {
            self.keys_down.push(key);
        }
    }

    fn release_key(&mut self, key: u8) {
        self.keys_down.retain(|&k| k != key);
    }
}

/// Factory producing `HeadlessEngine`s with a fixed link capacity.
#[derive(Debug, Clone)]
pub struct HeadlessEngineFactory {
    pub link_capacity: usize,
}

impl Default for HeadlessEngineFactory {
    fn default() -> Self {
        Self { link_capacity: 1 }
    }
}

impl EngineFactory for HeadlessEngineFactory {
    fn profiles(&self) -> &'static [HardwareProfile] {
        &PROFILES
    }

    fn guess_model(&self, rom: &[u8]) -> Option<&'static str> {
        // Test ROMs carry the model id as a "MODEL=<id>;" prefix.
        let text = std::str::from_utf8(rom.get(..16.min(rom.len()))?).ok()?;
        let id = text.strip_prefix("MODEL=")?.split(';').next()?;
        find_profile(id).map(|p| p.model_id)
    }

    fn create(
        &self,
        profile: &'static HardwareProfile,
        context: EngineContext,
    ) -> CalcResult<Box<dyn Engine>> {
        Ok(Box::new(
            HeadlessEngine::new(profile)
                .with_context(context)
                .with_link_capacity(self.link_capacity),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_link_reports_busy() {
        let mut engine = HeadlessEngine::ti83();
        assert!(engine.link_send_byte(0x41));
        assert!(!engine.stop_reason().contains(StopReason::LINK_WRITE_BYTE));
        assert!(!engine.link_send_byte(0x42));

        let result = engine.step(100, StepUnit::Cycles);
        assert!(result.reason.contains(StopReason::LINK_WRITE_BYTE));
        assert_eq!(result.remaining, 99);
        assert_eq!(engine.received(), &[0x41]);
    }

    #[test]
    fn test_scheduled_breakpoint() {
        let mut engine = HeadlessEngine::ti83();
        engine.schedule_breakpoint(150, EngineBreakpointId(7));

        let first = engine.step(100, StepUnit::Cycles);
        assert!(first.reason.is_empty());
        assert_eq!(first.remaining, 0);

        let second = engine.step(100, StepUnit::Cycles);
        assert_eq!(second.reason, StopReason::BREAKPOINT);
        assert_eq!(second.remaining, 50);
        assert_eq!(engine.stop_breakpoint(), Some(EngineBreakpointId(7)));
        assert_eq!(engine.elapsed(), 150);
    }

    #[test]
    fn test_guess_model_from_prefix() {
        let factory = HeadlessEngineFactory::default();
        assert_eq!(factory.guess_model(b"MODEL=86;rest"), Some("86"));
        assert_eq!(factory.guess_model(b"garbage"), None);
    }
}
