//! Thread-safe calculator controller.
//!
//! `Calc` owns at most one `Session` behind a single mutex. Every call that
//! touches session state takes that lock; `stop` does not, so it can
//! interrupt a run in progress on the worker thread.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::breakpoints::{BreakpointHandle, BreakpointTable};
use crate::config::Config;
use crate::engine::{
    BreakPredicate, BreakpointKind, BreakpointSpec, Engine, EngineContext, EngineFactory,
    HardwareProfile, StepUnit, StopHandle, StopReason, Z80EngineFactory,
};
use crate::error::{CalcError, CalcResult};
use crate::events::{CalcEvent, EventBus};
use crate::session::Session;
use crate::worker::{CalcWorker, RunTarget};

/// Result of `Calc::guess_rom_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomGuess {
    /// Descriptions of every supported model, in profile order.
    pub descriptions: Vec<&'static str>,
    /// Index into `descriptions` of the detected model.
    pub guessed: Option<usize>,
}

struct CalcInner {
    session: Mutex<Option<Session>>,
    stop_handle: RwLock<Option<StopHandle>>,
    events: Arc<EventBus>,
    broadcasting: AtomicBool,
    name: Mutex<String>,
    config: Config,
    factory: Box<dyn EngineFactory>,
}

impl CalcInner {
    fn lock(&self) -> CalcResult<MutexGuard<'_, Option<Session>>> {
        self.session.lock().map_err(|_| CalcError::LockPoisoned)
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> CalcResult<R>) -> CalcResult<R> {
        let mut guard = self.lock()?;
        let session = guard.as_mut().ok_or(CalcError::NoSession)?;
        f(session)
    }

    fn run(&self, amount: u32, unit: StepUnit) -> CalcResult<StopReason> {
        let broadcasting = self.broadcasting.load(Ordering::SeqCst);
        let events = &self.events;
        self.with_session(|session| {
            let outcome = session.run(amount, unit, &mut |event| {
                if broadcasting || event != CalcEvent::BytesAvailable {
                    events.emit(event);
                }
            });
            Ok(outcome.reason)
        })
    }

    fn stop(&self, reason: StopReason) {
        let handle = self
            .stop_handle
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle.as_ref() {
            if !handle.request(reason) {
                log::debug!("stop request with no run in progress ignored");
            }
        }
    }
}

impl RunTarget for CalcInner {
    fn run_slice(&self, amount: u32, unit: StepUnit) -> CalcResult<StopReason> {
        self.run(amount, unit)
    }

    fn interrupt(&self) {
        self.stop(StopReason::empty());
    }

    fn running_changed(&self, running: bool) {
        self.events.emit(CalcEvent::RunningChanged(running));
    }
}

/// Calculator controller.
pub struct Calc {
    inner: Arc<CalcInner>,
    worker: Mutex<CalcWorker>,
}

impl Calc {
    /// Controller backed by the built-in Z80 engine.
    pub fn new(config: Config) -> Self {
        Self::with_factory(config, Z80EngineFactory)
    }

    pub fn with_factory(config: Config, factory: impl EngineFactory + 'static) -> Self {
        let worker = CalcWorker::new(config.slice_us, config.yield_ms);
        Self {
            inner: Arc::new(CalcInner {
                session: Mutex::new(None),
                stop_handle: RwLock::new(None),
                events: Arc::new(EventBus::new()),
                broadcasting: AtomicBool::new(config.broadcast),
                name: Mutex::new(String::new()),
                config,
                factory: Box::new(factory),
            }),
            worker: Mutex::new(worker),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> Receiver<CalcEvent> {
        self.inner.events.subscribe()
    }

    // ---- Loading and saving ----

    /// Load a ROM image and optional save state, replacing the current
    /// session.
    ///
    /// The model is `model` if given, else detected from the ROM, else the
    /// configured default. On any error the current session is untouched.
    pub fn load(&self, rom: &Path, state: Option<&Path>, model: Option<&str>) -> CalcResult<()> {
        let rom_bytes = read_file(rom)?;
        let state_bytes = state.map(read_file).transpose()?;
        let profile = self.select_profile(&rom_bytes, model)?;

        let mut engine = self.inner.factory.create(profile, self.engine_context())?;
        let mut state_reader = state_bytes.as_deref();
        engine.load_state(
            &mut &rom_bytes[..],
            state_reader.as_mut().map(|r| r as &mut dyn Read),
        )?;
        let session = Session::new(engine).with_rom_path(rom);
        let stop_handle = session.stop_handle();

        log::info!("Loaded {} as {}", rom.display(), profile.description);
        self.inner.events.emit(CalcEvent::BeginLoad);
        self.stop_worker()?;

        let previous = self.inner.lock()?.replace(session);
        *self
            .inner
            .stop_handle
            .write()
            .map_err(|_| CalcError::LockPoisoned)? = Some(stop_handle);
        drop(previous);

        let name = rom
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.set_name(&name)?;

        let events = &self.inner.events;
        events.emit(CalcEvent::FileChanged(rom.to_path_buf()));
        events.emit(CalcEvent::Loaded);
        events.emit(CalcEvent::ModelChanged {
            name: profile.name.to_string(),
            description: profile.description.to_string(),
        });

        if self.inner.config.auto_start {
            self.start()?;
        }
        Ok(())
    }

    fn select_profile(
        &self,
        rom: &[u8],
        model: Option<&str>,
    ) -> CalcResult<&'static HardwareProfile> {
        let factory = &self.inner.factory;
        let find = |id: &str| {
            factory
                .profiles()
                .iter()
                .find(|p| p.model_id.eq_ignore_ascii_case(id))
        };

        if let Some(id) = model {
            return find(id).ok_or_else(|| CalcError::UnsupportedModel(id.to_string()));
        }
        if let Some(profile) = factory.guess_model(rom).and_then(find) {
            return Ok(profile);
        }

        let fallback = self.inner.config.default_model.as_deref().ok_or_else(|| {
            CalcError::UnsupportedModel("undetected ROM type and no default model".to_string())
        })?;
        log::warn!("Could not detect ROM type, assuming model {}", fallback);
        find(fallback).ok_or_else(|| CalcError::UnsupportedModel(fallback.to_string()))
    }

    fn engine_context(&self) -> EngineContext {
        let events = self.inner.events.clone();
        EngineContext::new(move |d| {
            events.emit(CalcEvent::Log {
                level: d.level,
                message: d.message.clone(),
                pc: d.pc,
            })
        })
    }

    /// Save the session.
    ///
    /// Flash models get their ROM written to `path`; the machine state always
    /// goes to a sibling file with a `.sav` extension.
    pub fn save(&self, path: &Path) -> CalcResult<()> {
        self.inner.with_session(|session| {
            let state_path = path.with_extension("sav");

            let mut rom_sink = if session.profile().has_flash() {
                match File::create(path) {
                    Ok(file) => Some(BufWriter::new(file)),
                    Err(e) => {
                        log::warn!("Unable to write {}: {}", path.display(), e);
                        None
                    }
                }
            } else {
                None
            };
            let mut state_sink = match File::create(&state_path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    log::warn!("Unable to write {}: {}", state_path.display(), e);
                    if rom_sink.is_none() {
                        return Err(CalcError::Open {
                            path: state_path,
                            source: e,
                        });
                    }
                    None
                }
            };

            session.engine_mut().save_state(
                rom_sink.as_mut().map(|w| w as &mut dyn Write),
                state_sink.as_mut().map(|w| w as &mut dyn Write),
            )?;
            if let Some(w) = rom_sink.as_mut() {
                w.flush()?;
            }
            if let Some(w) = state_sink.as_mut() {
                w.flush()?;
            }
            log::info!("Saved state to {}", state_path.display());
            Ok(())
        })
    }

    /// Detect the model of a ROM file.
    pub fn guess_rom_type(&self, path: &Path) -> CalcResult<RomGuess> {
        let rom = read_file(path)?;
        let profiles = self.inner.factory.profiles();
        let guessed = self
            .inner
            .factory
            .guess_model(&rom)
            .and_then(|id| profiles.iter().position(|p| p.model_id == id));
        Ok(RomGuess {
            descriptions: profiles.iter().map(|p| p.description).collect(),
            guessed,
        })
    }

    /// Reset the calculator. Held keys stay held.
    pub fn reset(&self) -> CalcResult<()> {
        log::debug!("reset");
        self.inner.with_session(|session| {
            session.reset();
            Ok(())
        })
    }

    // ---- Running ----

    /// Run the emulation for up to `amount` units on the calling thread.
    pub fn run(&self, amount: u32, unit: StepUnit) -> CalcResult<StopReason> {
        self.inner.run(amount, unit)
    }

    /// Interrupt the current run. Does not wait for the session lock.
    pub fn stop(&self, reason: StopReason) {
        self.inner.stop(reason);
    }

    fn worker(&self) -> CalcResult<MutexGuard<'_, CalcWorker>> {
        self.worker.lock().map_err(|_| CalcError::LockPoisoned)
    }

    /// Start the worker thread.
    pub fn start(&self) -> CalcResult<()> {
        if self.inner.lock()?.is_none() {
            return Err(CalcError::NoSession);
        }
        self.worker()?.start(self.inner.clone())
    }

    fn stop_worker(&self) -> CalcResult<()> {
        self.worker()?.stop(self.inner.as_ref())
    }

    /// Stop the worker thread, waiting until it is idle.
    pub fn pause(&self) -> CalcResult<()> {
        self.stop_worker()
    }

    pub fn resume(&self) -> CalcResult<()> {
        self.start()
    }

    /// Run a single slice on the worker thread, if it is idle.
    pub fn step(&self) -> CalcResult<()> {
        if self.inner.lock()?.is_none() {
            return Err(CalcError::NoSession);
        }
        self.worker()?.step(self.inner.clone())
    }

    pub fn is_running(&self) -> bool {
        self.worker().map(|w| w.is_running()).unwrap_or(false)
    }

    /// Block until the worker is idle.
    pub fn wait(&self) -> CalcResult<()> {
        self.worker()?.wait();
        Ok(())
    }

    // ---- Link bytes ----

    /// Queue a byte for the device.
    pub fn send_byte(&self, byte: u8) -> CalcResult<()> {
        self.inner.with_session(|session| {
            session.input_mut().append(byte);
            Ok(())
        })
    }

    pub fn send_bytes(&self, bytes: &[u8]) -> CalcResult<()> {
        self.inner.with_session(|session| {
            session.input_mut().append_all(bytes);
            Ok(())
        })
    }

    /// Take the oldest byte sent by the device.
    pub fn get_byte(&self) -> CalcResult<Option<u8>> {
        self.inner
            .with_session(|session| Ok(session.output_mut().pop_front()))
    }

    /// Take up to `n` bytes sent by the device.
    pub fn get_bytes(&self, n: usize) -> CalcResult<Vec<u8>> {
        self.inner
            .with_session(|session| Ok(session.output_mut().take_front(n)))
    }

    /// Oldest byte sent by the device, without consuming it.
    pub fn top_byte(&self) -> CalcResult<Option<u8>> {
        self.inner
            .with_session(|session| Ok(session.output().peek_front()))
    }

    /// Number of device bytes waiting to be read.
    pub fn byte_count(&self) -> CalcResult<usize> {
        self.inner.with_session(|session| Ok(session.output().count()))
    }

    /// Whether host bytes are still waiting to enter the device.
    pub fn is_sending(&self) -> bool {
        self.inner
            .with_session(|session| Ok(!session.input().is_empty()))
            .unwrap_or(false)
    }

    /// Whether device bytes are waiting to be read.
    pub fn is_receiving(&self) -> bool {
        self.inner
            .with_session(|session| Ok(!session.output().is_empty()))
            .unwrap_or(false)
    }

    pub fn set_broadcasting(&self, enabled: bool) {
        self.inner.broadcasting.store(enabled, Ordering::SeqCst);
    }

    pub fn is_broadcasting(&self) -> bool {
        self.inner.broadcasting.load(Ordering::SeqCst)
    }

    // ---- Breakpoints ----

    fn with_breakpoints<R>(
        &self,
        f: impl FnOnce(&mut BreakpointTable, &mut dyn Engine) -> CalcResult<R>,
    ) -> CalcResult<R> {
        self.inner.with_session(|session| {
            let (table, engine) = session.breakpoints_mut();
            f(table, engine)
        })
    }

    /// Add an execution breakpoint with an empty range.
    pub fn add_breakpoint(&self, predicate: Option<BreakPredicate>) -> CalcResult<BreakpointHandle> {
        self.inner
            .with_session(|session| Ok(session.add_breakpoint(predicate)))
    }

    pub fn add_breakpoint_with(
        &self,
        spec: BreakpointSpec,
        predicate: Option<BreakPredicate>,
    ) -> CalcResult<BreakpointHandle> {
        self.inner
            .with_session(|session| Ok(session.add_breakpoint_with(spec, predicate)))
    }

    pub fn remove_breakpoint(&self, handle: BreakpointHandle) -> CalcResult<()> {
        self.inner
            .with_session(|session| session.remove_breakpoint(handle))
    }

    pub fn breakpoint_count(&self) -> CalcResult<usize> {
        self.inner
            .with_session(|session| Ok(session.breakpoints().count()))
    }

    pub fn breakpoint_handles(&self) -> CalcResult<Vec<BreakpointHandle>> {
        self.inner
            .with_session(|session| Ok(session.breakpoints().handles()))
    }

    pub fn breakpoint_kind(&self, handle: BreakpointHandle) -> CalcResult<BreakpointKind> {
        self.with_breakpoints(|table, engine| table.kind(&*engine, handle))
    }

    pub fn set_breakpoint_kind(&self, handle: BreakpointHandle, kind: BreakpointKind) -> CalcResult<()> {
        self.with_breakpoints(|table, engine| table.set_kind(engine, handle, kind))
    }

    pub fn breakpoint_physical(&self, handle: BreakpointHandle) -> CalcResult<bool> {
        self.with_breakpoints(|table, engine| table.is_physical(&*engine, handle))
    }

    pub fn set_breakpoint_physical(&self, handle: BreakpointHandle, physical: bool) -> CalcResult<()> {
        self.with_breakpoints(|table, engine| table.set_physical(engine, handle, physical))
    }

    pub fn breakpoint_start(&self, handle: BreakpointHandle) -> CalcResult<u32> {
        self.with_breakpoints(|table, engine| table.start(&*engine, handle))
    }

    pub fn set_breakpoint_start(&self, handle: BreakpointHandle, start: u32) -> CalcResult<()> {
        self.with_breakpoints(|table, engine| table.set_start(engine, handle, start))
    }

    pub fn breakpoint_end(&self, handle: BreakpointHandle) -> CalcResult<u32> {
        self.with_breakpoints(|table, engine| table.end(&*engine, handle))
    }

    pub fn set_breakpoint_end(&self, handle: BreakpointHandle, end: u32) -> CalcResult<()> {
        self.with_breakpoints(|table, engine| table.set_end(engine, handle, end))
    }

    pub fn breakpoint_mask(&self, handle: BreakpointHandle) -> CalcResult<u32> {
        self.with_breakpoints(|table, engine| table.mask(&*engine, handle))
    }

    pub fn set_breakpoint_mask(&self, handle: BreakpointHandle, mask: u32) -> CalcResult<()> {
        self.with_breakpoints(|table, engine| table.set_mask(engine, handle, mask))
    }

    // ---- Keypad ----

    pub fn press_key(&self, key: u8) -> CalcResult<()> {
        self.inner.with_session(|session| {
            session.engine_mut().press_key(key);
            Ok(())
        })
    }

    pub fn release_key(&self, key: u8) -> CalcResult<()> {
        self.inner.with_session(|session| {
            session.engine_mut().release_key(key);
            Ok(())
        })
    }

    // ---- Display and model info ----

    /// Fold the current engine frame into the grayscale composite.
    pub fn lcd_update(&self) -> CalcResult<bool> {
        self.inner.with_session(|session| Ok(session.lcd_update()))
    }

    /// Copy of the composite LCD image, `0xFFRRGGBB` row-major.
    pub fn lcd_data(&self) -> CalcResult<Vec<u32>> {
        self.inner
            .with_session(|session| Ok(session.display().pixels().to_vec()))
    }

    /// Composite LCD image resampled to `width` x `height`.
    pub fn lcd_scaled(&self, width: usize, height: usize) -> CalcResult<Vec<u32>> {
        self.inner
            .with_session(|session| Ok(session.display().scaled(width, height)))
    }

    /// Profile of the loaded model.
    pub fn model(&self) -> Option<&'static HardwareProfile> {
        self.inner
            .with_session(|session| Ok(session.profile()))
            .ok()
    }

    pub fn model_name(&self) -> Option<&'static str> {
        self.model().map(|p| p.name)
    }

    pub fn model_description(&self) -> Option<&'static str> {
        self.model().map(|p| p.description)
    }

    pub fn lcd_width(&self) -> usize {
        self.model().map_or(0, |p| p.lcd_width)
    }

    pub fn lcd_height(&self) -> usize {
        self.model().map_or(0, |p| p.lcd_height)
    }

    /// Path of the loaded ROM.
    pub fn rom_file(&self) -> Option<PathBuf> {
        self.inner
            .with_session(|session| Ok(session.rom_path().map(Path::to_path_buf)))
            .ok()
            .flatten()
    }

    pub fn name(&self) -> String {
        match self.inner.name.lock() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_name(&self, name: &str) -> CalcResult<()> {
        {
            let mut current = self.inner.name.lock().map_err(|_| CalcError::LockPoisoned)?;
            if *current == name {
                return Ok(());
            }
            *current = name.to_string();
        }
        self.inner
            .events
            .emit(CalcEvent::NameChanged(name.to_string()));
        Ok(())
    }
}

impl Drop for Calc {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            log::warn!("Failed to stop worker: {}", e);
        }
    }
}

fn read_file(path: &Path) -> CalcResult<Vec<u8>> {
    fs::read(path).map_err(|source| CalcError::Open {
        path: path.to_path_buf(),
        source,
    })
}
