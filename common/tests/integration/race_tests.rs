//! Request handling and the control loop sharing one scheduler.

use std::{
    sync::{Arc, Mutex},
    thread,
};

use pump_common::{api::pump_reply, CommandInterpreter, PumpLabel, PumpScheduler};

use crate::mock_output::{booted_pump, RecordingOutput};

fn shared_pump() -> Arc<Mutex<PumpScheduler<RecordingOutput>>> {
    Arc::new(Mutex::new(booted_pump()))
}

#[test]
fn off_racing_a_firing_deadline_never_reengages() {
    for round in 0..200u32 {
        let pump = shared_pump();
        let interpreter = CommandInterpreter::default();
        pump_reply(
            &mut *pump.lock().unwrap(),
            &interpreter,
            br#"{"state":"on","durationMs":10}"#,
            0,
        );

        let ticker = {
            let pump = pump.clone();
            thread::spawn(move || {
                for now in 0..50u32 {
                    pump.lock().unwrap().tick(now).unwrap();
                }
            })
        };
        let requester = {
            let pump = pump.clone();
            thread::spawn(move || {
                pump_reply(
                    &mut *pump.lock().unwrap(),
                    &interpreter,
                    br#"{"state":"off"}"#,
                    round % 20,
                )
            })
        };

        ticker.join().unwrap();
        let reply = requester.join().unwrap();

        let pump = pump.lock().unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(pump.snapshot().state, PumpLabel::Off);
        assert!(!pump.output().energized());
        assert!(!pump.state().deadline_armed());
    }
}

#[test]
fn later_on_command_wins_over_tick() {
    let pump = shared_pump();
    let interpreter = CommandInterpreter::default();
    pump_reply(
        &mut *pump.lock().unwrap(),
        &interpreter,
        br#"{"state":"on","durationMs":100}"#,
        0,
    );

    pump.lock().unwrap().tick(100).unwrap();
    pump_reply(&mut *pump.lock().unwrap(), &interpreter, br#"{"state":"on"}"#, 101);
    pump.lock().unwrap().tick(5_000).unwrap();

    let pump = pump.lock().unwrap();
    assert_eq!(pump.snapshot().state, PumpLabel::On);
    assert!(pump.output().energized());
}
