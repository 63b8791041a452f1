//! The 12-byte telemetry record exchanged between the sensing and reporting
//! devices, and both ends of the bus it travels over.
//!
//! Layout: `[0:4)` temperature, `[4:8)` humidity, `[8:12)` sound level, each
//! an IEEE-754 single in little-endian order. There is no tag or length
//! prefix; any transfer that is not exactly `DATA_SIZE` bytes is a fault.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use rppal::i2c::I2c;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::traits::BusRequester;

pub const DATA_SIZE: usize = 12;
pub const DEFAULT_I2C_ADDRESS: u16 = 0x08;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Substituted whenever a transfer fails.
pub const FALLBACK: Telemetry = Telemetry {
    temperature: 25.0,
    humidity: 50.0,
    sound_level: 30.0,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub temperature: f32,
    pub humidity: f32,
    pub sound_level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryBuffer([u8; DATA_SIZE]);

impl TelemetryBuffer {
    pub fn pack(telemetry: &Telemetry) -> TelemetryBuffer {
        let mut bytes = [0u8; DATA_SIZE];
        bytes[0..4].copy_from_slice(&telemetry.temperature.to_le_bytes());
        bytes[4..8].copy_from_slice(&telemetry.humidity.to_le_bytes());
        bytes[8..12].copy_from_slice(&telemetry.sound_level.to_le_bytes());
        TelemetryBuffer(bytes)
    }

    pub fn unpack(&self) -> Telemetry {
        let field = |offset: usize| {
            f32::from_le_bytes([
                self.0[offset],
                self.0[offset + 1],
                self.0[offset + 2],
                self.0[offset + 3],
            ])
        };

        Telemetry {
            temperature: field(0),
            humidity: field(4),
            sound_level: field(8),
        }
    }

    pub fn as_bytes(&self) -> &[u8; DATA_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for TelemetryBuffer {
    type Error = anyhow::Error;

    fn try_from(received: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; DATA_SIZE] = received.try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid transfer: expected {} bytes, got {}",
                DATA_SIZE,
                received.len()
            )
        })?;
        Ok(TelemetryBuffer(bytes))
    }
}

/// Decodes a received transfer, substituting `FALLBACK` for anything but a
/// complete record.
pub fn decode_or_fallback(received: &[u8]) -> Telemetry {
    match TelemetryBuffer::try_from(received) {
        Ok(buffer) => buffer.unpack(),
        Err(e) => {
            log::warn!("{e}, using fallback reading");
            FALLBACK
        }
    }
}

/// Performs one bus request and decodes it, never failing.
///
/// The request buffer has room for one byte more than a record, so an
/// oversized reply reaches `decode_or_fallback` with its real length.
pub fn request_telemetry<B: BusRequester + ?Sized>(bus: &mut B) -> Telemetry {
    let mut buf = [0u8; DATA_SIZE + 1];
    match bus.request(&mut buf) {
        Ok(received) => decode_or_fallback(&buf[..received.min(buf.len())]),
        Err(e) => {
            log::warn!("Telemetry request failed: {e:#}, using fallback reading");
            FALLBACK
        }
    }
}

/// Where the reporting device finds the sensing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTarget {
    I2c(u16),
    Tcp(String),
}

impl FromStr for BusTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "i2c" {
            return Ok(BusTarget::I2c(DEFAULT_I2C_ADDRESS));
        }

        match s.split_once(':') {
            Some(("i2c", address)) => {
                let address = match address.strip_prefix("0x") {
                    Some(hex) => u16::from_str_radix(hex, 16),
                    None => address.parse(),
                }
                .with_context(|| format!("Invalid I2C address: {address}"))?;
                Ok(BusTarget::I2c(address))
            }
            Some(("tcp", address)) if !address.is_empty() => Ok(BusTarget::Tcp(address.to_string())),
            _ => Err(anyhow::anyhow!(
                "Invalid bus target: expected i2c:<address> or tcp:<host:port>, got {s}"
            )),
        }
    }
}

impl BusTarget {
    pub fn connect(&self) -> Result<Box<dyn BusRequester + Send>, anyhow::Error> {
        match self {
            BusTarget::I2c(address) => Ok(Box::new(I2cRequester::new(*address)?)),
            BusTarget::Tcp(address) => Ok(Box::new(TcpRequester::new(address, DEFAULT_TIMEOUT)?)),
        }
    }
}

#[derive(Debug)]
pub struct I2cRequester {
    i2c: I2c,
}

impl I2cRequester {
    pub fn new(address: u16) -> Result<I2cRequester, anyhow::Error> {
        let mut i2c = I2c::new().context("Failed to initialize I2C")?;
        i2c.set_slave_address(address)
            .with_context(|| format!("Failed to set I2C address {address:#04x}"))?;

        Ok(I2cRequester { i2c })
    }
}

impl BusRequester for I2cRequester {
    /// Clocks in exactly one record; the master sets the transfer length.
    fn request(&mut self, buf: &mut [u8]) -> Result<usize, anyhow::Error> {
        let len = buf.len().min(DATA_SIZE);
        self.i2c
            .read(&mut buf[..len])
            .context("Failed to read telemetry over I2C")
    }
}

#[derive(Debug)]
pub struct TcpRequester {
    address: SocketAddr,
    timeout: Duration,
}

impl TcpRequester {
    pub fn new(address: &str, timeout: Duration) -> Result<TcpRequester, anyhow::Error> {
        let address = address
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {address}"))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("No address found for {address}"))?;

        Ok(TcpRequester { address, timeout })
    }
}

impl BusRequester for TcpRequester {
    fn request(&mut self, buf: &mut [u8]) -> Result<usize, anyhow::Error> {
        let stream = TcpStream::connect_timeout(&self.address, self.timeout)
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .context("Failed to set read timeout")?;

        let mut received = Vec::with_capacity(buf.len());
        stream
            .take(buf.len() as u64)
            .read_to_end(&mut received)
            .context("Failed to read telemetry")?;

        buf[..received.len()].copy_from_slice(&received);
        Ok(received.len())
    }
}

/// Producer end: the latest packed buffer, replaced on every update tick.
#[derive(Debug)]
pub struct TelemetryPublisher {
    tx: watch::Sender<TelemetryBuffer>,
}

impl TelemetryPublisher {
    pub fn new() -> (TelemetryPublisher, watch::Receiver<TelemetryBuffer>) {
        let (tx, rx) = watch::channel(TelemetryBuffer::default());
        (TelemetryPublisher { tx }, rx)
    }

    pub fn publish(&self, telemetry: &Telemetry) {
        self.tx.send_replace(TelemetryBuffer::pack(telemetry));
    }
}

/// Answers every connection with the most recently published buffer.
pub async fn serve_responder(
    listener: TcpListener,
    latest: watch::Receiver<TelemetryBuffer>,
) -> Result<(), anyhow::Error> {
    loop {
        let (mut stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept bus request")?;
        let buffer = *latest.borrow();

        tokio::spawn(async move {
            if let Err(e) = stream.write_all(buffer.as_bytes()).await {
                log::warn!("Failed to answer bus request from {peer}: {e}");
                return;
            }
            let _ = stream.shutdown().await;
            log::debug!("Answered bus request from {peer}");
        });
    }
}
