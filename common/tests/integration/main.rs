//! Host-side scenarios for the pump HTTP surface and control loop.
//!
//! Each `mod` below drives [`pump_common::PumpScheduler`] through a
//! recording output, so tests can assert on every pin write.

mod http_scenarios;
mod mock_output;
mod race_tests;
