//! Bounded emulation interleaved with link service.

use crate::engine::{Engine, EngineBreakpointId, LogLevel, StepUnit, StopReason};
use crate::events::CalcEvent;
use crate::session::Session;

/// Result of `Session::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Stop reason of the last engine step.
    pub reason: StopReason,
    /// Engine breakpoint that ended the run, if any.
    pub breakpoint: Option<EngineBreakpointId>,
}

impl<E: Engine + ?Sized> Session<E> {
    /// Run the engine for up to `amount` units.
    ///
    /// Every iteration services the link once and steps the engine for the
    /// units still left. A step reporting that the device wants another byte
    /// always earns at least one more iteration, so queued input keeps
    /// flowing even when the budget is spent. The run ends on a breakpoint,
    /// a link fault, a stop request, or when the budget runs out.
    ///
    /// Stop requests are only honoured while the run is in progress; one
    /// made between runs does not carry over.
    pub fn run(
        &mut self,
        amount: u32,
        unit: StepUnit,
        notify: &mut dyn FnMut(CalcEvent),
    ) -> RunOutcome {
        self.stop_handle.arm();
        let outcome = self.run_armed(amount, unit, notify);
        self.stop_handle.disarm();
        outcome
    }

    fn run_armed(
        &mut self,
        amount: u32,
        unit: StepUnit,
        notify: &mut dyn FnMut(CalcEvent),
    ) -> RunOutcome {
        let mut remaining = amount as i64;

        loop {
            let activity = self
                .link
                .service(&mut *self.engine, &mut self.input, &mut self.output);
            if activity.received.is_some() {
                notify(CalcEvent::BytesAvailable);
            }

            let result = self.engine.step(remaining, unit);
            let reason = result.reason;
            remaining = result.remaining;

            if reason.contains(StopReason::LINK_WRITE_BYTE) {
                self.link.release();
                remaining = remaining.max(1);
            }

            if reason.contains(StopReason::LINK_ERROR) {
                self.link.reset(&mut *self.engine);
                notify(CalcEvent::Log {
                    level: LogLevel::Warning,
                    message: "link error, link port reset".to_string(),
                    pc: 0,
                });
                return RunOutcome {
                    reason,
                    breakpoint: None,
                };
            }

            if reason.contains(StopReason::BREAKPOINT) {
                let breakpoint = self.engine.stop_breakpoint();
                if let Some(engine_id) = breakpoint {
                    log::debug!("stopped on engine breakpoint {}", engine_id);
                    notify(CalcEvent::Breakpoint {
                        engine_id,
                        handle: self.breakpoints.handle_for(engine_id),
                    });
                }
                return RunOutcome { reason, breakpoint };
            }

            if reason.contains(StopReason::REQUESTED) || remaining <= 0 {
                return RunOutcome {
                    reason,
                    breakpoint: None,
                };
            }
        }
    }
}
