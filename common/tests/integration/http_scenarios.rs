use pretty_assertions::assert_eq;
use pump_common::{
    api::{pump_reply, status_reply},
    CommandInterpreter, PumpLabel,
};
use serde_json::json;

use crate::mock_output::booted_pump;

#[test]
fn status_before_any_command_is_idle() {
    let pump = booted_pump();

    let reply = status_reply(&pump);

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, json!({ "state": "idle" }));
    assert!(!pump.output().energized());
}

#[test]
fn timed_on_then_auto_off() {
    let mut pump = booted_pump();
    let interpreter = CommandInterpreter::default();

    let reply = pump_reply(
        &mut pump,
        &interpreter,
        br#"{"state":"on","durationMs":5000}"#,
        0,
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, json!({ "state": "on" }));
    assert!(pump.output().energized());

    pump.tick(4_999).unwrap();
    assert_eq!(status_reply(&pump).body, json!({ "state": "on" }));
    assert!(pump.output().energized());

    pump.tick(5_000).unwrap();
    assert_eq!(status_reply(&pump).body, json!({ "state": "off" }));
    assert!(!pump.output().energized());
}

#[test]
fn off_from_any_state() {
    let interpreter = CommandInterpreter::default();
    let preludes: [Option<&[u8]>; 4] = [
        None,
        Some(br#"{"state":"on"}"#.as_slice()),
        Some(br#"{"state":"on","durationMs":60000}"#.as_slice()),
        Some(br#"{"state":"off"}"#.as_slice()),
    ];

    for prelude in preludes {
        let mut pump = booted_pump();
        if let Some(body) = prelude {
            pump_reply(&mut pump, &interpreter, body, 0);
        }

        let reply = pump_reply(&mut pump, &interpreter, br#"{"state":"off"}"#, 10);

        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, json!({ "state": "off" }));
        assert!(!pump.output().energized());
    }
}

#[test]
fn missing_state_is_rejected() {
    let mut pump = booted_pump();

    let reply = pump_reply(
        &mut pump,
        &CommandInterpreter::default(),
        br#"{"nope":"on"}"#,
        0,
    );

    assert_eq!(reply.status, 400);
    assert_eq!(reply.body, json!({ "error": "Missing 'state'" }));
}

#[test]
fn unknown_state_lists_allowed_values() {
    let mut pump = booted_pump();

    let reply = pump_reply(
        &mut pump,
        &CommandInterpreter::default(),
        br#"{"state":"sideways"}"#,
        0,
    );

    assert_eq!(reply.status, 400);
    assert_eq!(
        reply.body,
        json!({ "error": "Invalid state", "allowed": ["on", "off"] })
    );
}

#[test]
fn rejected_requests_do_not_touch_the_pump() {
    let mut pump = booted_pump();
    let interpreter = CommandInterpreter::new(10_000);
    pump_reply(&mut pump, &interpreter, br#"{"state":"on","durationMs":5000}"#, 0);
    let before = *pump.state();
    let writes = pump.output().write_count();

    let bodies: [&[u8]; 4] = [
        b"not json",
        br#"{"nope":"off"}"#,
        br#"{"state":"maybe"}"#,
        br#"{"state":"on","durationMs":20000}"#,
    ];
    for body in bodies {
        let reply = pump_reply(&mut pump, &interpreter, body, 100);
        assert_eq!(reply.status, 400);
    }

    assert_eq!(*pump.state(), before);
    assert_eq!(pump.output().write_count(), writes);
}

#[test]
fn invalid_json_reply() {
    let mut pump = booted_pump();

    let reply = pump_reply(&mut pump, &CommandInterpreter::default(), b"{", 0);

    assert_eq!(reply.status, 400);
    assert_eq!(reply.body, json!({ "error": "Invalid JSON" }));
    assert_eq!(pump.snapshot().state, PumpLabel::Idle);
}

#[test]
fn hardware_fault_surfaces_as_500_and_recovers() {
    let mut pump = booted_pump();
    let interpreter = CommandInterpreter::default();
    pump.output_mut().failing = true;

    let reply = pump_reply(&mut pump, &interpreter, br#"{"state":"on"}"#, 0);
    assert_eq!(reply.status, 500);
    assert_eq!(reply.body["error"], "Hardware fault");
    assert_eq!(status_reply(&pump).body, json!({ "state": "unknown" }));

    assert!(pump.tick(200).is_err());

    pump.output_mut().failing = false;
    pump.tick(400).unwrap();
    assert_eq!(status_reply(&pump).body, json!({ "state": "off" }));
    assert!(!pump.output().energized());
}
