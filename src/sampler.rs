use crate::clock::Cadence;
use crate::measurement::Climate;
use crate::traits::EnvironmentSensor;

pub const SENSOR_CHECK_INTERVAL_MS: u64 = 1000;
pub const TEMPERATURE_THRESHOLD: f32 = 0.5;
pub const HUMIDITY_THRESHOLD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Significant,
    Steady,
}

/// Polls the environmental sensor on a fixed cadence and keeps the last
/// significant reading as the baseline for change detection.
#[derive(Debug)]
pub struct EnvironmentalSampler {
    cadence: Cadence,
    baseline: Climate,
}

impl EnvironmentalSampler {
    pub fn new(interval_ms: u64) -> EnvironmentalSampler {
        Self::with_baseline(
            interval_ms,
            Climate {
                temperature: 0.0,
                humidity: 0.0,
            },
        )
    }

    pub fn with_baseline(interval_ms: u64, baseline: Climate) -> EnvironmentalSampler {
        EnvironmentalSampler {
            cadence: Cadence::new(interval_ms),
            baseline,
        }
    }

    #[cfg(test)]
    pub fn baseline(&self) -> Climate {
        self.baseline
    }

    /// Classifies `climate` against the baseline, moving the baseline on a
    /// significant change.
    pub fn classify(&mut self, climate: Climate) -> Change {
        let significant = (climate.temperature - self.baseline.temperature).abs()
            >= TEMPERATURE_THRESHOLD
            || (climate.humidity - self.baseline.humidity).abs() >= HUMIDITY_THRESHOLD;

        if significant {
            self.baseline = climate;
            Change::Significant
        } else {
            Change::Steady
        }
    }

    /// Reads the sensor if the cadence is due.
    pub fn poll<S>(&mut self, now_ms: u64, sensor: &mut S) -> Result<Option<(Climate, Change)>, anyhow::Error>
    where
        S: EnvironmentSensor + ?Sized,
    {
        if !self.cadence.due(now_ms) {
            return Ok(None);
        }

        let climate = sensor.read()?;
        let change = self.classify(climate);

        Ok(Some((climate, change)))
    }
}
