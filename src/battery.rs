//! Battery percentage from a resistor-divider analog read.

use embedded_hal::delay::DelayNs;

use crate::mcp3008::MAX_READING;
use crate::traits::AnalogInput;

pub const SAMPLE_COUNT: u32 = 10;
pub const SAMPLE_DELAY_MS: u32 = 2;

pub const REFERENCE_VOLTAGE: f32 = 3.3;
/// (R1 + R2) / R2 for a 20k/10k divider
pub const DIVIDER_RATIO: f32 = 3.0;
/// 2S Li-ion pack
pub const MIN_VOLTAGE: f32 = 6.5;
pub const MAX_VOLTAGE: f32 = 8.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryModel {
    pub reference_voltage: f32,
    pub full_scale: f32,
    pub divider_ratio: f32,
    pub min_voltage: f32,
    pub max_voltage: f32,
}

impl Default for BatteryModel {
    fn default() -> Self {
        BatteryModel {
            reference_voltage: REFERENCE_VOLTAGE,
            full_scale: MAX_READING as f32,
            divider_ratio: DIVIDER_RATIO,
            min_voltage: MIN_VOLTAGE,
            max_voltage: MAX_VOLTAGE,
        }
    }
}

impl BatteryModel {
    pub fn pack_voltage(&self, raw: f32) -> f32 {
        raw / self.full_scale * self.reference_voltage * self.divider_ratio
    }

    /// Linear map of pack voltage onto `[0, 100]`, saturating at both ends.
    pub fn percent(&self, raw: f32) -> f32 {
        let voltage = self.pack_voltage(raw);
        let percent =
            (voltage - self.min_voltage) / (self.max_voltage - self.min_voltage) * 100.0;
        percent.clamp(0.0, 100.0)
    }
}

#[derive(Debug)]
pub struct BatteryGauge<A, D> {
    input: A,
    delay: D,
    model: BatteryModel,
}

impl<A: AnalogInput, D: DelayNs> BatteryGauge<A, D> {
    pub fn new(input: A, delay: D, model: BatteryModel) -> BatteryGauge<A, D> {
        BatteryGauge {
            input,
            delay,
            model,
        }
    }

    /// Averages `SAMPLE_COUNT` reads taken `SAMPLE_DELAY_MS` apart.
    pub fn read_average(&mut self) -> Result<f32, anyhow::Error> {
        let mut sum: u32 = 0;
        for i in 0..SAMPLE_COUNT {
            sum += u32::from(self.input.read()?);
            if i + 1 < SAMPLE_COUNT {
                self.delay.delay_ms(SAMPLE_DELAY_MS);
            }
        }

        Ok(sum as f32 / SAMPLE_COUNT as f32)
    }

    pub fn read_percent(&mut self) -> Result<f32, anyhow::Error> {
        let raw = self.read_average()?;
        let percent = self.model.percent(raw);
        log::debug!(
            "Battery: raw={raw:.1} pack={:.2}V percent={percent:.0}",
            self.model.pack_voltage(raw)
        );
        Ok(percent)
    }
}
