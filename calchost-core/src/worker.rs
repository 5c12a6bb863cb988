//! Dedicated emulation thread.
//!
//! The worker repeatedly runs one time slice, then yields for a short
//! wall-clock pause. The pause is a condition-variable wait, so a stop
//! request wakes it at once.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{StepUnit, StopReason};
use crate::error::{CalcError, CalcResult};

/// What the worker drives.
pub trait RunTarget: Send + Sync + 'static {
    /// Run the emulation for `amount` units.
    fn run_slice(&self, amount: u32, unit: StepUnit) -> CalcResult<StopReason>;

    /// Interrupt a slice in progress on another thread.
    fn interrupt(&self);

    /// Called from the worker thread when it starts and stops.
    fn running_changed(&self, _running: bool) {}
}

#[derive(Debug, Default)]
struct WorkerState {
    running: bool,
    exiting: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_exiting(&self) -> bool {
        self.lock().exiting
    }
}

/// Handle to the emulation thread.
#[derive(Debug)]
pub struct CalcWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    slice_us: u32,
    yield_ms: u64,
}

impl CalcWorker {
    pub fn new(slice_us: u32, yield_ms: u64) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            thread: None,
            slice_us: slice_us.max(1),
            yield_ms,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Start running slices until stopped or paused. No-op if running.
    pub fn start<T: RunTarget>(&mut self, target: Arc<T>) -> CalcResult<()> {
        self.spawn(target, false)
    }

    /// Run exactly one slice on the worker. No-op if running.
    pub fn step<T: RunTarget>(&mut self, target: Arc<T>) -> CalcResult<()> {
        self.spawn(target, true)
    }

    fn spawn<T: RunTarget>(&mut self, target: Arc<T>, once: bool) -> CalcResult<()> {
        if self.is_running() {
            return Ok(());
        }
        // Reap a thread that paused itself.
        self.join()?;

        {
            let mut state = self.shared.lock();
            state.running = true;
            state.exiting = false;
        }

        let shared = self.shared.clone();
        let slice_us = self.slice_us;
        let pause = Duration::from_millis(self.yield_ms);
        let spawned = thread::Builder::new()
            .name("calchost-worker".to_string())
            .spawn(move || worker_loop(&shared, target.as_ref(), slice_us, pause, once));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.lock().running = false;
                Err(CalcError::Io(e))
            }
        }
    }

    /// Ask the thread to exit and wait until it has.
    pub fn stop<T: RunTarget + ?Sized>(&mut self, target: &T) -> CalcResult<()> {
        {
            let mut state = self.shared.lock();
            if state.running {
                state.exiting = true;
            }
        }
        self.shared.cond.notify_all();
        if self.is_running() {
            target.interrupt();
        }
        self.wait();
        self.join()
    }

    /// Block until the worker is idle.
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while state.running {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn join(&mut self) -> CalcResult<()> {
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| CalcError::WorkerPanicked)?;
        }
        Ok(())
    }
}

fn worker_loop<T: RunTarget + ?Sized>(
    shared: &Shared,
    target: &T,
    slice_us: u32,
    pause: Duration,
    once: bool,
) {
    log::debug!("worker started");
    target.running_changed(true);

    loop {
        if shared.is_exiting() {
            // Let the engine settle on an instruction boundary.
            if let Err(e) = target.run_slice(1, StepUnit::Cycles) {
                log::warn!("final slice failed: {}", e);
            }
            break;
        }

        match target.run_slice(slice_us, StepUnit::Microseconds) {
            Ok(reason) => {
                if shared.is_exiting() {
                    continue;
                }
                if reason.intersects(StopReason::BREAKPOINT | StopReason::REQUESTED) {
                    log::debug!("worker paused: {:?}", reason);
                    break;
                }
            }
            Err(e) => {
                log::warn!("worker stopped: {}", e);
                break;
            }
        }

        if once {
            break;
        }

        let state = shared.lock();
        let _ = shared
            .cond
            .wait_timeout_while(state, pause, |s| !s.exiting)
            .unwrap_or_else(PoisonError::into_inner);
    }

    {
        let mut state = shared.lock();
        state.running = false;
        state.exiting = false;
    }
    shared.cond.notify_all();
    target.running_changed(false);
    log::debug!("worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(u32, StepUnit)>>,
        running: Mutex<Vec<bool>>,
        interrupted: AtomicBool,
        /// Stop reason to report from the n-th slice.
        pause_at: Option<(usize, StopReason)>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(u32, StepUnit)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RunTarget for Recorder {
        fn run_slice(&self, amount: u32, unit: StepUnit) -> CalcResult<StopReason> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((amount, unit));
            match self.pause_at {
                Some((n, reason)) if calls.len() == n => Ok(reason),
                _ => Ok(StopReason::empty()),
            }
        }

        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
        }

        fn running_changed(&self, running: bool) {
            self.running.lock().unwrap().push(running);
        }
    }

    #[test]
    fn test_stop_runs_final_cycle() {
        let target = Arc::new(Recorder::default());
        let mut worker = CalcWorker::new(100, 1);

        worker.start(target.clone()).unwrap();
        assert!(worker.is_running());
        std::thread::sleep(Duration::from_millis(20));
        worker.stop(target.as_ref()).unwrap();

        assert!(!worker.is_running());
        assert!(target.interrupted.load(Ordering::SeqCst));
        let calls = target.calls();
        assert_eq!(calls.first(), Some(&(100, StepUnit::Microseconds)));
        assert_eq!(calls.last(), Some(&(1, StepUnit::Cycles)));
        assert_eq!(*target.running.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_pauses_on_breakpoint() {
        let target = Arc::new(Recorder {
            pause_at: Some((3, StopReason::BREAKPOINT)),
            ..Recorder::default()
        });
        let mut worker = CalcWorker::new(100, 0);

        worker.start(target.clone()).unwrap();
        worker.wait();

        assert!(!worker.is_running());
        assert_eq!(target.calls().len(), 3);
    }

    #[test]
    fn test_step_runs_one_slice() {
        let target = Arc::new(Recorder::default());
        let mut worker = CalcWorker::new(250, 1000);

        worker.step(target.clone()).unwrap();
        worker.wait();

        assert_eq!(target.calls(), vec![(250, StepUnit::Microseconds)]);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let target = Recorder::default();
        let mut worker = CalcWorker::new(100, 1);
        worker.stop(&target).unwrap();
        assert!(target.calls().is_empty());
        assert!(!target.interrupted.load(Ordering::SeqCst));
    }
}
