use thiserror::Error;

use crate::{
    clock::{deadline_after, deadline_passed, overdue_ms, remaining_ms},
    types::{PumpAction, PumpCommand, PumpLabel, PumpSnapshot, PumpStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pump output write failed: {0}")]
pub struct HardwareFault(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PumpError {
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
}

/// Drives the physical pump line.
pub trait PumpOutput {
    fn write(&mut self, engaged: bool) -> Result<(), HardwareFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEvent {
    Engaged { duration_ms: Option<u32> },
    Released,
    AutoOff { late_by_ms: u32 },
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    /// Last level confirmed by the output driver.
    pub output_engaged: bool,
    pub label: PumpLabel,
    pub deadline_at_ms: Option<u32>,
    /// A write failed; the real level is unknown until a release succeeds.
    pub recovery_pending: bool,
}

impl ActuatorState {
    fn boot() -> Self {
        Self {
            output_engaged: false,
            label: PumpLabel::Idle,
            deadline_at_ms: None,
            recovery_pending: false,
        }
    }

    pub fn deadline_armed(&self) -> bool {
        self.deadline_at_ms.is_some()
    }
}

/// Owns the pump output and enforces timed auto-off.
///
/// Not synchronized: callers that share it between the HTTP server and the
/// control loop must wrap it in a mutex and hold the lock for the whole of
/// each `apply` / `tick` call.
#[derive(Debug)]
pub struct PumpScheduler<O: PumpOutput> {
    output: O,
    state: ActuatorState,
    last_event: Option<PumpEvent>,
}

impl<O: PumpOutput> PumpScheduler<O> {
    /// Drives the output to de-energized before returning.
    pub fn new(mut output: O) -> Result<Self, HardwareFault> {
        output.write(false)?;
        Ok(Self {
            output,
            state: ActuatorState::boot(),
            last_event: None,
        })
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn last_event(&self) -> Option<PumpEvent> {
        self.last_event
    }

    pub fn apply(&mut self, command: PumpCommand, now_ms: u32) -> Result<PumpSnapshot, PumpError> {
        let event = match command.action {
            PumpAction::TurnOff => {
                self.drive(false)?;
                self.state.label = PumpLabel::Off;
                self.state.deadline_at_ms = None;
                PumpEvent::Released
            }
            PumpAction::TurnOn => {
                self.drive(true)?;
                self.state.label = PumpLabel::On;
                self.state.deadline_at_ms = command
                    .duration_ms
                    .map(|duration_ms| deadline_after(now_ms, duration_ms));
                PumpEvent::Engaged {
                    duration_ms: command.duration_ms,
                }
            }
        };

        self.last_event = Some(event);
        Ok(self.snapshot())
    }

    pub fn tick(&mut self, now_ms: u32) -> Result<Option<PumpEvent>, PumpError> {
        if self.state.recovery_pending {
            self.drive(false)?;
            self.state.label = PumpLabel::Off;
            return Ok(self.record(PumpEvent::Recovered));
        }

        let Some(deadline_ms) = self.state.deadline_at_ms else {
            return Ok(None);
        };
        if !deadline_passed(now_ms, deadline_ms) {
            return Ok(None);
        }

        self.drive(false)?;
        self.state.label = PumpLabel::Off;
        self.state.deadline_at_ms = None;
        Ok(self.record(PumpEvent::AutoOff {
            late_by_ms: overdue_ms(now_ms, deadline_ms),
        }))
    }

    pub fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            state: self.state.label,
        }
    }

    pub fn status(&self, now_ms: u32) -> PumpStatus {
        PumpStatus {
            state: self.state.label,
            engaged: self.state.output_engaged,
            auto_off_armed: self.state.deadline_armed(),
            remaining_ms: self
                .state
                .deadline_at_ms
                .map(|deadline_ms| remaining_ms(now_ms, deadline_ms)),
            fault: self.state.recovery_pending,
        }
    }

    fn drive(&mut self, engaged: bool) -> Result<(), HardwareFault> {
        match self.output.write(engaged) {
            Ok(()) => {
                self.state.output_engaged = engaged;
                self.state.recovery_pending = false;
                Ok(())
            }
            Err(fault) => {
                self.state.label = PumpLabel::Unknown;
                self.state.deadline_at_ms = None;
                self.state.recovery_pending = true;
                Err(fault)
            }
        }
    }

    fn record(&mut self, event: PumpEvent) -> Option<PumpEvent> {
        self.last_event = Some(event);
        Some(event)
    }
}
