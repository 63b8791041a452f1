//! Device wiring: rppal peripherals behind the crate's traits.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital;
use rppal::gpio::{Gpio, OutputPin};
use rppal::hal::Delay;

use crate::audio::{self, SampleSlot};
use crate::cli::LedArgs;
use crate::indicator::{Color, DisconnectedPattern, Led, RgbLed, StatusLed};
use crate::link::{Link, StaticLink};
use crate::mcp3008::MCP3008;
use crate::nmcli::NmcliLink;
use crate::sensor::Bme280Sensor;
use crate::traits::{AnalogInput, EnvironmentSensor};

const HALT_BLINK_MS: u32 = 100;
const HALT_REPEAT: u32 = 10;

pub fn led(gpio: &Gpio, pin: u8, active_low: bool) -> Result<Led<OutputPin>, anyhow::Error> {
    let mut output = gpio
        .get(pin)
        .with_context(|| format!("Failed to acquire GPIO {pin}"))?
        .into_output();
    if active_low {
        output.set_high();
    } else {
        output.set_low();
    }

    Ok(Led::new(output, active_low))
}

pub fn rgb_led(gpio: &Gpio, args: &LedArgs) -> Result<RgbLed<OutputPin>, anyhow::Error> {
    Ok(RgbLed::new(
        led(gpio, args.red_pin, args.active_low)?,
        led(gpio, args.green_pin, args.active_low)?,
        led(gpio, args.blue_pin, args.active_low)?,
    ))
}

pub fn status_led(
    gpio: &Gpio,
    pin: u8,
    active_low: bool,
    disconnected: DisconnectedPattern,
) -> Result<StatusLed<OutputPin>, anyhow::Error> {
    Ok(StatusLed::new(led(gpio, pin, active_low)?, disconnected))
}

/// Opens and initialises the BME280, retrying a bounded number of times.
pub fn environment_sensor() -> Result<Box<dyn EnvironmentSensor + Send>, anyhow::Error> {
    let mut sensor = Bme280Sensor::new().context("Failed to initialize BME280")?;
    sensor.init()?;
    Ok(Box::new(sensor))
}

pub fn adc_channel(channel: u8) -> Result<Box<dyn AnalogInput + Send>, anyhow::Error> {
    let adc = MCP3008::new().context("Failed to initialize MCP3008")?;
    Ok(Box::new(adc.into_channel(channel)?))
}

/// NetworkManager-driven link on `interface`, or an always-up link when the
/// OS manages networking on its own.
pub fn link(interface: Option<&str>) -> Box<dyn Link + Send> {
    match interface {
        Some(interface) => Box::new(NmcliLink::new(interface)),
        None => Box::new(StaticLink),
    }
}

/// Starts capturing PCM from `path` into a fresh sample slot.
pub fn microphone(path: &Path) -> Result<Arc<SampleSlot>, anyhow::Error> {
    let source = File::open(path)
        .with_context(|| format!("Failed to open PCM source {}", path.display()))?;
    let slot = Arc::new(SampleSlot::new());
    audio::spawn_capture(BufReader::new(source), slot.clone());
    log::info!("Capturing audio from {}", path.display());

    Ok(slot)
}

/// Stops the device for good after an unrecoverable initialisation fault.
pub fn halt(mut rgb: Option<RgbLed<OutputPin>>, error: &anyhow::Error) -> ! {
    let mut delay = Delay;
    loop {
        signal_fault(rgb.as_mut(), &mut delay, error);
    }
}

/// One round of the halt signal: the diagnostic, then `HALT_REPEAT` fast red
/// blinks (or the same pause without an RGB LED).
pub fn signal_fault<P, D>(rgb: Option<&mut RgbLed<P>>, delay: &mut D, error: &anyhow::Error)
where
    P: digital::OutputPin,
    D: DelayNs,
{
    log::error!("Halted: {error:#}");
    match rgb {
        Some(rgb) => {
            for _ in 0..HALT_REPEAT {
                rgb.show(Color::Red);
                delay.delay_ms(HALT_BLINK_MS);
                rgb.off();
                delay.delay_ms(HALT_BLINK_MS);
            }
        }
        None => delay.delay_ms(HALT_BLINK_MS * 2 * HALT_REPEAT),
    }
}
