//! Upstream network link and the supervisor that keeps it up.

use std::thread;
use std::time::{Duration, Instant};

use backon::{BlockingRetryable, ConstantBuilder};
use embedded_hal::digital::OutputPin;

use crate::indicator::StatusLed;

pub const PUSH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONSOLE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
    /// Present for WPA2-Enterprise networks
    pub username: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"********")
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ssid: String,
    /// Signal quality as reported by the radio
    pub signal: i32,
    pub security: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub signal: Option<i32>,
}

pub trait Link {
    /// Starts joining a network; completion is observed through `status`.
    fn begin(&mut self, credentials: &Credentials) -> Result<(), anyhow::Error>;

    fn status(&mut self) -> ConnectionState;

    fn disconnect(&mut self) -> Result<(), anyhow::Error>;

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, anyhow::Error>;

    fn info(&mut self) -> Result<LinkInfo, anyhow::Error>;
}

/// A link managed outside this process, treated as always up.
#[derive(Debug, Default)]
pub struct StaticLink;

impl Link for StaticLink {
    fn begin(&mut self, _credentials: &Credentials) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn status(&mut self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn disconnect(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, anyhow::Error> {
        Ok(Vec::new())
    }

    fn info(&mut self) -> Result<LinkInfo, anyhow::Error> {
        Ok(LinkInfo::default())
    }
}

/// How hard to try when joining a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempt_timeout: PUSH_ATTEMPT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            retry_delay: Duration::ZERO,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    fn builder(&self) -> ConstantBuilder {
        // The first attempt is not a retry.
        let retries = self
            .max_attempts
            .map_or(usize::MAX, |attempts| attempts.saturating_sub(1));

        ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(retries)
    }
}

pub struct ConnectionSupervisor {
    link: Box<dyn Link + Send>,
    state: ConnectionState,
    policy: RetryPolicy,
    origin: Instant,
}

impl ConnectionSupervisor {
    pub fn new(link: Box<dyn Link + Send>, policy: RetryPolicy) -> ConnectionSupervisor {
        ConnectionSupervisor {
            link,
            state: ConnectionState::Disconnected,
            policy,
            origin: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&mut self) -> &mut (dyn Link + Send) {
        self.link.as_mut()
    }

    /// Records `next`, logging only on a genuine transition.
    fn observe(&mut self, next: ConnectionState) -> bool {
        if next == self.state {
            return false;
        }

        match (self.state, next) {
            (_, ConnectionState::Connected) => log::info!("Link established"),
            (ConnectionState::Connected, _) => log::warn!("Link lost"),
            (_, ConnectionState::Connecting) => log::info!("Link connecting"),
            (_, ConnectionState::Disconnected) => log::info!("Link down"),
        }
        self.state = next;
        true
    }

    /// Queries the link once. Returns true if the state changed.
    pub fn poll(&mut self) -> bool {
        let next = self.link.status();
        self.observe(next)
    }

    /// One bounded attempt: begin, then poll until connected or timed out,
    /// blinking `led` meanwhile.
    pub fn attempt<P: OutputPin>(
        &mut self,
        credentials: &Credentials,
        led: &mut StatusLed<P>,
    ) -> Result<(), anyhow::Error> {
        log::info!("Connecting to {}", credentials.ssid);
        self.observe(ConnectionState::Connecting);
        if let Err(e) = self.link.begin(credentials) {
            self.observe(ConnectionState::Disconnected);
            return Err(e.context(format!("Failed to join {}", credentials.ssid)));
        }

        let started = Instant::now();
        while started.elapsed() < self.policy.attempt_timeout {
            if self.link.status() == ConnectionState::Connected {
                self.observe(ConnectionState::Connected);
                led.update(self.state, self.now_ms());
                return Ok(());
            }
            led.update(ConnectionState::Connecting, self.now_ms());
            thread::sleep(self.policy.poll_interval);
        }

        self.observe(ConnectionState::Disconnected);
        led.update(self.state, self.now_ms());
        Err(anyhow::anyhow!(
            "Timed out joining {} after {:?}",
            credentials.ssid,
            self.policy.attempt_timeout
        ))
    }

    /// Repeats `attempt` per the retry policy.
    pub fn connect<P: OutputPin>(
        &mut self,
        credentials: &Credentials,
        led: &mut StatusLed<P>,
    ) -> Result<(), anyhow::Error> {
        let builder = self.policy.builder();

        (|| self.attempt(credentials, led))
            .retry(builder)
            .notify(|e, dur| {
                log::warn!("{e:#}");
                log::info!("Retrying in {:?}", dur);
            })
            .call()
    }

    /// Starts a join without waiting for it; `poll` observes the outcome.
    pub fn rejoin(&mut self, credentials: &Credentials) -> Result<(), anyhow::Error> {
        log::info!("Rejoining {}", credentials.ssid);
        self.observe(ConnectionState::Connecting);
        self.link.begin(credentials).map_err(|e| {
            self.observe(ConnectionState::Disconnected);
            e.context(format!("Failed to rejoin {}", credentials.ssid))
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn disconnect(&mut self) -> Result<(), anyhow::Error> {
        self.link.disconnect()?;
        self.observe(ConnectionState::Disconnected);
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
