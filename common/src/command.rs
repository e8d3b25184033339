use serde_json::Value;
use thiserror::Error;

use crate::{
    clock::MAX_DEADLINE_SPAN_MS,
    types::{PumpAction, PumpCommand},
};

pub const ALLOWED_STATES: [&str; 2] = ["on", "off"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("request body is not a JSON object")]
    InvalidPayload,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("state must be \"on\" or \"off\"")]
    InvalidState,
    #[error("durationMs must be an integer between 0 and {max_ms}")]
    InvalidDuration { max_ms: u32 },
}

/// Decodes `POST /pump` bodies into [`PumpCommand`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInterpreter {
    max_duration_ms: u32,
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self {
            max_duration_ms: MAX_DEADLINE_SPAN_MS,
        }
    }
}

impl CommandInterpreter {
    pub fn new(max_duration_ms: u32) -> Self {
        Self {
            max_duration_ms: max_duration_ms.min(MAX_DEADLINE_SPAN_MS),
        }
    }

    pub fn max_duration_ms(&self) -> u32 {
        self.max_duration_ms
    }

    pub fn interpret(&self, raw: &[u8]) -> Result<PumpCommand, CommandError> {
        let body: Value = serde_json::from_slice(raw).map_err(|_| CommandError::InvalidPayload)?;
        let Some(fields) = body.as_object() else {
            return Err(CommandError::InvalidPayload);
        };

        let action = match fields.get("state") {
            None | Some(Value::Null) => return Err(CommandError::MissingField("state")),
            Some(Value::String(state)) if state == "on" => PumpAction::TurnOn,
            Some(Value::String(state)) if state == "off" => PumpAction::TurnOff,
            Some(_) => return Err(CommandError::InvalidState),
        };

        match action {
            PumpAction::TurnOff => Ok(PumpCommand::off()),
            PumpAction::TurnOn => match fields.get("durationMs") {
                None | Some(Value::Null) => Ok(PumpCommand::on()),
                Some(value) => self.duration(value).map(PumpCommand::on_for),
            },
        }
    }

    fn duration(&self, value: &Value) -> Result<u32, CommandError> {
        value
            .as_u64()
            .filter(|ms| *ms <= u64::from(self.max_duration_ms))
            .map(|ms| ms as u32)
            .ok_or(CommandError::InvalidDuration {
                max_ms: self.max_duration_ms,
            })
    }
}

pub fn interpret(raw: &[u8]) -> Result<PumpCommand, CommandError> {
    CommandInterpreter::default().interpret(raw)
}
