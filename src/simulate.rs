//! Stand-in hive: random but plausible readings pushed through the normal
//! reporting path, for exercising an ingest server without hardware.

use std::ops::Range;

use chrono::Local;
use rand::Rng;

use crate::clock::Cadence;
use crate::measurement::SensorReading;
use crate::report::{ReportOutcome, Reporter};

pub const DEFAULT_DEVICE_ID: &str = "beehive_simulator_1";
pub const SEND_INTERVAL_MS: u64 = 5000;

pub const TEMPERATURE_RANGE: Range<f32> = 20.0..30.0;
pub const HUMIDITY_RANGE: Range<f32> = 40.0..70.0;
pub const SOUND_RANGE: Range<f32> = 30.0..60.0;
pub const BATTERY_RANGE: Range<f32> = 50.0..100.0;

fn round_to(value: f32, decimals: i32) -> f32 {
    let scale = 10f32.powi(decimals);
    (value * scale).round() / scale
}

/// Draws one reading, stamped with the wall clock in milliseconds.
pub fn generate<R: Rng>(rng: &mut R) -> SensorReading {
    SensorReading {
        temperature: round_to(rng.gen_range(TEMPERATURE_RANGE), 2),
        humidity: round_to(rng.gen_range(HUMIDITY_RANGE), 2),
        sound_level: round_to(rng.gen_range(SOUND_RANGE), 2),
        battery_percent: rng.gen_range(BATTERY_RANGE).round(),
        ..SensorReading::new(Local::now().timestamp_millis().max(0) as u64)
    }
}

pub struct Simulator<R> {
    rng: R,
    reporter: Reporter,
    cadence: Cadence,
}

impl<R: Rng> Simulator<R> {
    pub fn new(rng: R, reporter: Reporter, interval_ms: u64) -> Simulator<R> {
        Simulator {
            rng,
            reporter,
            cadence: Cadence::new(interval_ms),
        }
    }

    /// Sends one generated reading when the interval is due.
    pub fn tick(&mut self, now_ms: u64) -> Option<ReportOutcome> {
        if !self.cadence.due(now_ms) {
            return None;
        }

        let reading = generate(&mut self.rng);
        log::info!("{reading:?}");
        Some(self.reporter.send(&reading))
    }
}
