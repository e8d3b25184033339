//! Recording pump output for integration tests.

use pump_common::{HardwareFault, PumpOutput, PumpScheduler};

#[derive(Debug, Default)]
pub struct RecordingOutput {
    pub writes: Vec<bool>,
    pub failing: bool,
}

impl RecordingOutput {
    pub fn energized(&self) -> bool {
        self.writes.last().copied().unwrap_or(false)
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }
}

impl PumpOutput for RecordingOutput {
    fn write(&mut self, engaged: bool) -> Result<(), HardwareFault> {
        if self.failing {
            return Err(HardwareFault("relay driver not responding".to_string()));
        }
        self.writes.push(engaged);
        Ok(())
    }
}

pub fn booted_pump() -> PumpScheduler<RecordingOutput> {
    PumpScheduler::new(RecordingOutput::default()).expect("recording output never fails at boot")
}
