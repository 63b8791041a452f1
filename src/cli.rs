use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::battery::DIVIDER_RATIO;
use crate::bridge::RgbSource;
use crate::indicator::DisconnectedPattern;
use crate::ingest::DEFAULT_LISTEN;
use crate::link::{CONSOLE_ATTEMPT_TIMEOUT, Credentials, POLL_INTERVAL, PUSH_ATTEMPT_TIMEOUT, RetryPolicy};
use crate::report::{DEFAULT_PATH, DEFAULT_PORT, Endpoint, REPORT_INTERVAL_MS, REQUEST_TIMEOUT};
use crate::sampler::SENSOR_CHECK_INTERVAL_MS;
use crate::server::{DEFAULT_DEVICE_NAME, DEFAULT_SAMPLE_RATE, SAMPLE_RATE_RANGE, Settings};
use crate::simulate::{DEFAULT_DEVICE_ID, SEND_INTERVAL_MS};
use crate::telemetry::BusTarget;

#[derive(Debug, Parser)]
#[command(name = "hive-monitor")]
#[command(version)]
#[command(about = "Beehive sensor node: samples, relays and reports hive conditions", long_about = None)]
pub struct Cli {
    /// Log level
    #[arg(long, global = true, default_value = "info", env = "HIVE_LOG_LEVEL")]
    pub log_level: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reporting device: gather readings and push them to the ingest endpoint
    Report(ReportArgs),
    /// Sensing device: sample locally and answer telemetry bus requests
    Respond(RespondArgs),
    /// Serve the latest readings and settings over HTTP
    Serve(ServeArgs),
    /// Interactive Wi-Fi credential console
    Console(ConsoleArgs),
    /// Accept reports and serve the latest one back
    Collect(CollectArgs),
    /// Push random hive readings to an ingest server
    Simulate(SimulateArgs),
}

/// BCM GPIO numbers of the indicator LEDs
#[derive(Debug, Clone, Args)]
pub struct LedArgs {
    #[arg(long, default_value_t = 17, env = "HIVE_LED_RED")]
    pub red_pin: u8,

    #[arg(long, default_value_t = 27, env = "HIVE_LED_GREEN")]
    pub green_pin: u8,

    #[arg(long, default_value_t = 22, env = "HIVE_LED_BLUE")]
    pub blue_pin: u8,

    /// Drive LEDs low to light them
    #[arg(long, default_value_t = false, env = "HIVE_LED_ACTIVE_LOW")]
    pub active_low: bool,
}

#[derive(Debug, Clone, Args)]
pub struct LinkArgs {
    /// Wi-Fi interface managed through nmcli; without it the link is assumed up
    #[arg(long, env = "HIVE_WIFI_INTERFACE")]
    pub interface: Option<String>,

    #[arg(long, env = "HIVE_WIFI_SSID")]
    pub ssid: Option<String>,

    #[arg(long, env = "HIVE_WIFI_PASSWORD", hide_env_values = true, default_value = "")]
    pub password: String,

    /// WPA2-Enterprise identity
    #[arg(long, env = "HIVE_WIFI_USERNAME")]
    pub username: Option<String>,

    /// Seconds to wait for one join attempt
    #[arg(long, default_value_t = PUSH_ATTEMPT_TIMEOUT.as_secs(), env = "HIVE_ATTEMPT_TIMEOUT")]
    pub attempt_timeout: u64,

    /// Milliseconds between join attempts
    #[arg(long, default_value_t = 0, env = "HIVE_RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,

    /// Give up after this many attempts (retries forever if unset)
    #[arg(long, env = "HIVE_MAX_ATTEMPTS")]
    pub max_attempts: Option<usize>,

    /// Status LED while the link is down
    #[arg(long, value_enum, default_value_t = DisconnectedPattern::Off, env = "HIVE_DISCONNECTED_LED")]
    pub disconnected: DisconnectedPattern,
}

impl LinkArgs {
    pub fn credentials(&self) -> Option<Credentials> {
        self.ssid.as_ref().map(|ssid| Credentials {
            ssid: ssid.clone(),
            password: self.password.clone(),
            username: self.username.clone(),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            poll_interval: POLL_INTERVAL,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    /// Ingest server host
    #[arg(long, env = "HIVE_HOST")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT, env = "HIVE_PORT")]
    pub port: u16,

    #[arg(long, default_value = DEFAULT_PATH, env = "HIVE_PATH")]
    pub path: String,

    /// Use HTTPS
    #[arg(long, default_value_t = false, env = "HIVE_TLS")]
    pub tls: bool,

    #[arg(long, default_value = "hive-1", env = "HIVE_DEVICE_ID")]
    pub device_id: String,

    /// Seconds before a report request is abandoned
    #[arg(long, default_value_t = REQUEST_TIMEOUT.as_secs(), env = "HIVE_REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    #[arg(long, default_value_t = REPORT_INTERVAL_MS, env = "HIVE_REPORT_INTERVAL_MS")]
    pub report_interval_ms: u64,

    #[arg(long, default_value_t = SENSOR_CHECK_INTERVAL_MS, env = "HIVE_SAMPLE_INTERVAL_MS")]
    pub sample_interval_ms: u64,

    /// Request readings from a sensing device (i2c:<address> or tcp:<host:port>)
    /// instead of sampling locally
    #[arg(long, env = "HIVE_BUS")]
    pub bus: Option<BusTarget>,

    /// Signed 16-bit little-endian PCM source for local sound levels
    #[arg(long, env = "HIVE_PCM")]
    pub pcm: Option<PathBuf>,

    /// MCP3008 channel wired to the battery divider
    #[arg(long, default_value_t = 0, env = "HIVE_BATTERY_CHANNEL")]
    pub battery_channel: u8,

    #[arg(long, default_value_t = DIVIDER_RATIO, env = "HIVE_DIVIDER_RATIO")]
    pub divider_ratio: f32,

    /// Metric shown on the RGB LED
    #[arg(long, value_enum, default_value_t = RgbSource::Sound, env = "HIVE_RGB")]
    pub rgb: RgbSource,

    #[arg(long, default_value_t = 23, env = "HIVE_LED_STATUS")]
    pub status_pin: u8,

    #[command(flatten)]
    pub leds: LedArgs,

    #[command(flatten)]
    pub link: LinkArgs,
}

impl ReportArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            secure: self.tls,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RespondArgs {
    /// Address answering telemetry bus requests
    #[arg(long, default_value = "0.0.0.0:7070", env = "HIVE_LISTEN")]
    pub listen: SocketAddr,

    #[arg(long, env = "HIVE_PCM")]
    pub pcm: Option<PathBuf>,

    #[arg(long, default_value_t = SENSOR_CHECK_INTERVAL_MS, env = "HIVE_SAMPLE_INTERVAL_MS")]
    pub sample_interval_ms: u64,

    #[command(flatten)]
    pub leds: LedArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:80", env = "HIVE_LISTEN")]
    pub listen: SocketAddr,

    #[arg(long, default_value = DEFAULT_DEVICE_NAME, env = "HIVE_DEVICE_NAME")]
    pub device_name: String,

    /// Seconds between sensor reads
    #[arg(
        long,
        default_value_t = DEFAULT_SAMPLE_RATE,
        value_parser = clap::value_parser!(u32).range(i64::from(*SAMPLE_RATE_RANGE.start())..=i64::from(*SAMPLE_RATE_RANGE.end())),
        env = "HIVE_SAMPLE_RATE"
    )]
    pub sample_rate: u32,

    /// MCP3008 channel wired to the light sensor
    #[arg(long, default_value_t = 1, env = "HIVE_LIGHT_CHANNEL")]
    pub light_channel: u8,

    /// LED switched by the ledEnabled setting
    #[arg(long, default_value_t = 23, env = "HIVE_LED_STATUS")]
    pub led_pin: u8,

    #[arg(long, default_value_t = false, env = "HIVE_LED_ACTIVE_LOW")]
    pub active_low: bool,

    #[command(flatten)]
    pub link: LinkArgs,
}

impl ServeArgs {
    pub fn settings(&self) -> Settings {
        Settings {
            led_enabled: true,
            sample_rate: self.sample_rate,
            device_name: self.device_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConsoleArgs {
    #[arg(long, default_value = "wlan0", env = "HIVE_WIFI_INTERFACE")]
    pub interface: String,

    #[arg(long, default_value_t = 23, env = "HIVE_LED_STATUS")]
    pub status_pin: u8,

    #[arg(long, default_value_t = false, env = "HIVE_LED_ACTIVE_LOW")]
    pub active_low: bool,

    /// Seconds to wait for one join attempt
    #[arg(long, default_value_t = CONSOLE_ATTEMPT_TIMEOUT.as_secs(), env = "HIVE_ATTEMPT_TIMEOUT")]
    pub attempt_timeout: u64,

    #[arg(long, default_value_t = 1, env = "HIVE_MAX_ATTEMPTS")]
    pub max_attempts: usize,
}

impl ConsoleArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            poll_interval: POLL_INTERVAL,
            retry_delay: Duration::ZERO,
            max_attempts: Some(self.max_attempts),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CollectArgs {
    #[arg(long, default_value = DEFAULT_LISTEN, env = "HIVE_LISTEN")]
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Ingest server host
    #[arg(long, default_value = "127.0.0.1", env = "HIVE_HOST")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT, env = "HIVE_PORT")]
    pub port: u16,

    #[arg(long, default_value = DEFAULT_PATH, env = "HIVE_PATH")]
    pub path: String,

    #[arg(long, default_value_t = false, env = "HIVE_TLS")]
    pub tls: bool,

    #[arg(long, default_value = DEFAULT_DEVICE_ID, env = "HIVE_DEVICE_ID")]
    pub device_id: String,

    #[arg(long, default_value_t = SEND_INTERVAL_MS, env = "HIVE_REPORT_INTERVAL_MS")]
    pub interval_ms: u64,

    #[arg(long, default_value_t = REQUEST_TIMEOUT.as_secs(), env = "HIVE_REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    /// Leave `sound` out of the payload
    #[arg(long, default_value_t = false)]
    pub no_sound: bool,
}

impl SimulateArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            secure: self.tls,
        }
    }
}
