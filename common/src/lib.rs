pub mod api;
pub mod clock;
pub mod command;
pub mod config;
pub mod pump;
pub mod schedule;
pub mod types;

pub use api::ApiReply;
pub use command::{interpret, CommandError, CommandInterpreter};
pub use config::{HardwareConfig, NetworkConfig, PumpConfig, RuntimeConfig};
pub use pump::{ActuatorState, HardwareFault, PumpError, PumpEvent, PumpOutput, PumpScheduler};
pub use schedule::{DayOfWeek, IrrigationTrigger, Schedule, ScheduleEntry, ScheduledRun};
pub use types::{
    ControllerStatus, HealthStatus, PumpAction, PumpCommand, PumpLabel, PumpSnapshot, PumpStatus,
    TimeStatus, TimezoneUpdate,
};

pub const SERVICE_NAME: &str = "pump-controller";
