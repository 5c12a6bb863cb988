//! Observer notifications.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::breakpoints::BreakpointHandle;
use crate::engine::{EngineBreakpointId, LogLevel};

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalcEvent {
    /// A load is about to replace the current session.
    BeginLoad,
    Loaded,
    FileChanged(PathBuf),
    NameChanged(String),
    ModelChanged {
        name: String,
        description: String,
    },
    /// A byte was appended to the output queue.
    BytesAvailable,
    /// A run stopped on a breakpoint. `handle` is None if the engine id is
    /// not in the table (e.g. added directly on the engine).
    Breakpoint {
        engine_id: EngineBreakpointId,
        handle: Option<BreakpointHandle>,
    },
    RunningChanged(bool),
    Log {
        level: LogLevel,
        message: String,
        pc: u32,
    },
}

/// Fan-out of events to any number of channel subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CalcEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CalcEvent> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Deliver `event` to every live subscriber; hung-up ones are dropped.
    pub fn emit(&self, event: CalcEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
