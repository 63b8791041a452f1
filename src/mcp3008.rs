use anyhow::Context;
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::traits::AnalogInput;

pub const CLOCK_SPEED: u32 = 1_350_000;
pub const MODE: Mode = Mode::Mode0;

pub const START_BIT: u8 = 0x01;
pub const SINGLE_ENDED: u8 = 0x08;
pub const CHANNELS: u8 = 8;

/// Full-scale reading of the 10-bit converter
pub const MAX_READING: u16 = 1023;

#[derive(Debug)]
pub struct MCP3008 {
    spi: Spi,
}

impl MCP3008 {
    pub fn new() -> Result<MCP3008, anyhow::Error> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, CLOCK_SPEED, MODE)
            .context("Failed to initialize SPI")?;

        Ok(MCP3008 { spi })
    }

    pub fn read_channel(&mut self, channel: u8) -> Result<u16, anyhow::Error> {
        let command = request_frame(channel)?;

        let mut response = [0u8; 3];
        self.spi
            .transfer(&mut response, &command)
            .context("Failed to transfer ADC request over SPI")?;

        Ok(decode_response(&response))
    }

    pub fn into_channel(self, channel: u8) -> Result<AdcChannel, anyhow::Error> {
        request_frame(channel)?;
        Ok(AdcChannel { adc: self, channel })
    }
}

/// One single-ended input of an MCP3008
#[derive(Debug)]
pub struct AdcChannel {
    adc: MCP3008,
    channel: u8,
}

impl AnalogInput for AdcChannel {
    fn read(&mut self) -> Result<u16, anyhow::Error> {
        self.adc.read_channel(self.channel)
    }
}

pub fn request_frame(channel: u8) -> Result<[u8; 3], anyhow::Error> {
    if channel >= CHANNELS {
        return Err(anyhow::anyhow!(
            "Invalid channel: expected 0..{}, got {}",
            CHANNELS,
            channel
        ));
    }

    Ok([START_BIT, (SINGLE_ENDED | channel) << 4, 0x00])
}

pub fn decode_response(response: &[u8; 3]) -> u16 {
    (((response[1] & 0x03) as u16) << 8) | response[2] as u16
}
