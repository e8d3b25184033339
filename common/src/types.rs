use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    TurnOn,
    TurnOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpCommand {
    pub action: PumpAction,
    /// Auto-off delay. Only meaningful for [`PumpAction::TurnOn`]; `None`
    /// keeps the pump on until an explicit off.
    pub duration_ms: Option<u32>,
}

impl PumpCommand {
    pub fn on() -> Self {
        Self {
            action: PumpAction::TurnOn,
            duration_ms: None,
        }
    }

    pub fn on_for(duration_ms: u32) -> Self {
        Self {
            action: PumpAction::TurnOn,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn off() -> Self {
        Self {
            action: PumpAction::TurnOff,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpLabel {
    Idle,
    On,
    Off,
    Unknown,
}

impl PumpLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpSnapshot {
    pub state: PumpLabel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpStatus {
    pub state: PumpLabel,
    pub engaged: bool,
    #[serde(rename = "autoOffArmed")]
    pub auto_off_armed: bool,
    #[serde(rename = "remainingMs")]
    pub remaining_ms: Option<u32>,
    pub fault: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub pump: PumpStatus,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    #[serde(rename = "nextScheduleEventEpoch")]
    pub next_schedule_event_epoch: Option<i64>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub service: &'static str,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeStatus {
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
}

#[derive(Debug, Deserialize)]
pub struct TimezoneUpdate {
    pub timezone: String,
}
