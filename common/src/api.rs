//! Status code and JSON body for every reply of the pump HTTP surface.
//!
//! Both the ESP32 server and the host simulator route requests to these
//! builders so the wire format is defined in one place.

use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    command::{CommandError, CommandInterpreter, ALLOWED_STATES},
    pump::{PumpError, PumpOutput, PumpScheduler},
    types::PumpSnapshot,
};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const STATUS_PAYLOAD_TOO_LARGE: u16 = 413;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: u16,
    pub body: Value,
}

impl ApiReply {
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(body) => Self {
                status: STATUS_OK,
                body,
            },
            Err(_) => Self::error(STATUS_INTERNAL_ERROR, "Serialization failed"),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    pub fn invalid_json() -> Self {
        Self::error(STATUS_BAD_REQUEST, "Invalid JSON")
    }

    pub fn method_not_allowed() -> Self {
        Self::error(STATUS_METHOD_NOT_ALLOWED, "Method not allowed")
    }

    pub fn payload_too_large() -> Self {
        Self::error(STATUS_PAYLOAD_TOO_LARGE, "Request body too large")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&self.body).unwrap_or_default()
    }
}

impl From<&CommandError> for ApiReply {
    fn from(err: &CommandError) -> Self {
        match err {
            CommandError::InvalidPayload => Self::invalid_json(),
            CommandError::MissingField(field) => {
                Self::error(STATUS_BAD_REQUEST, &format!("Missing '{field}'"))
            }
            CommandError::InvalidState => Self {
                status: STATUS_BAD_REQUEST,
                body: json!({ "error": "Invalid state", "allowed": ALLOWED_STATES }),
            },
            CommandError::InvalidDuration { max_ms } => Self {
                status: STATUS_BAD_REQUEST,
                body: json!({ "error": "Invalid 'durationMs'", "maxDurationMs": max_ms }),
            },
        }
    }
}

impl From<&PumpError> for ApiReply {
    fn from(err: &PumpError) -> Self {
        match err {
            PumpError::Hardware(fault) => Self {
                status: STATUS_INTERNAL_ERROR,
                body: json!({ "error": "Hardware fault", "detail": fault.0 }),
            },
        }
    }
}

pub fn status_reply<O: PumpOutput>(pump: &PumpScheduler<O>) -> ApiReply {
    ApiReply::ok(&pump.snapshot())
}

pub fn applied_reply(result: &Result<PumpSnapshot, PumpError>) -> ApiReply {
    match result {
        Ok(snapshot) => ApiReply::ok(snapshot),
        Err(err) => err.into(),
    }
}

/// Decode, validate and apply one `POST /pump` body in a single step.
///
/// The pump is only touched once the body has been fully validated.
pub fn pump_reply<O: PumpOutput>(
    pump: &mut PumpScheduler<O>,
    interpreter: &CommandInterpreter,
    body: &[u8],
    now_ms: u32,
) -> ApiReply {
    match interpreter.interpret(body) {
        Ok(command) => applied_reply(&pump.apply(command, now_ms)),
        Err(err) => (&err).into(),
    }
}
