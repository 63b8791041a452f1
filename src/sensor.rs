use std::time::Duration;

use anyhow::Context as _;
use backon::{BlockingRetryable, ConstantBuilder};
use bme280::i2c::BME280;
use rppal::{hal::Delay, i2c::I2c};

use crate::{measurement::Climate, traits::EnvironmentSensor};

pub const RETRY_DELAY: Duration = Duration::from_millis(100);
pub const RETRY_TIMES: usize = 20;

pub fn retry_builder() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(RETRY_DELAY)
        .with_max_times(RETRY_TIMES)
}

#[derive(Debug)]
pub struct Bme280Sensor {
    delay: Delay,
    bme280: BME280<I2c>,
}

impl Bme280Sensor {
    pub fn new() -> Result<Bme280Sensor, anyhow::Error> {
        let i2c = I2c::new().context("Failed to initialize I2C")?;
        let bme280 = BME280::new_primary(i2c);

        Ok(Bme280Sensor {
            delay: Delay,
            bme280,
        })
    }
}

impl EnvironmentSensor for Bme280Sensor {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        (|| self.bme280.init(&mut self.delay))
            .retry(retry_builder())
            .notify(|e, dur| {
                log::error!("{e:?}");
                log::info!("Retrying in {:?}", dur);
            })
            .call()
            .map_err(|e| anyhow::anyhow!("Failed to initialize BME280: {e:?}"))
    }

    fn read(&mut self) -> Result<Climate, anyhow::Error> {
        let m = (|| self.bme280.measure(&mut self.delay))
            .retry(retry_builder().with_max_times(3))
            .notify(|e, dur| {
                log::warn!("{e:?}");
                log::info!("Retrying in {:?}", dur);
            })
            .call()
            .map_err(|e| anyhow::anyhow!("Failed to read BME280 measurements: {e:?}"))?;

        Ok(Climate {
            temperature: m.temperature,
            humidity: m.humidity,
        })
    }
}
