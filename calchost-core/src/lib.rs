//! Calculator Emulator Host Core
//!
//! This crate drives a calculator emulation engine from the host side:
//! - Bounded run loop interleaving CPU steps with link port service
//! - Virtual serial link fed by FIFO byte queues
//! - Breakpoints addressed by stable handles
//! - Grayscale LCD compositing that mimics panel ghosting
//!
//! # Architecture
//!
//! The controller is layered:
//! - `Engine` trait: CPU and hardware emulation (see `engine`)
//! - `Session`: one engine with its queues, breakpoints and display buffers
//! - `Calc`: thread-safe controller with an emulation worker thread
//! - `CalcEvent`: observer notifications delivered over channels

pub mod breakpoints;
pub mod calc;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod events;
pub mod link;
pub mod queue;
pub mod run_loop;
pub mod session;
pub mod worker;

pub use breakpoints::{BreakpointHandle, BreakpointTable};
pub use calc::{Calc, RomGuess};
pub use config::Config;
pub use display::DisplayCompositor;
pub use engine::{
    BreakPredicate, BreakpointKind, BreakpointSpec, Engine, EngineBreakpointId, EngineContext,
    EngineFactory, HardwareProfile, LogLevel, StepUnit, StopReason,
};
pub use error::{CalcError, CalcResult};
pub use events::{CalcEvent, EventBus};
pub use link::{LinkActivity, LinkPortBridge};
pub use queue::ByteQueue;
pub use run_loop::RunOutcome;
pub use session::Session;
pub use worker::CalcWorker;
