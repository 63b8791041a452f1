//! Line-oriented credential console: prompts for Wi-Fi credentials, joins
//! the network and answers `reset`, `status`, `scan` and `help`.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;

use embedded_hal::digital::OutputPin;

use crate::bridge::LOOP_INTERVAL;
use crate::clock::{Cadence, MonotonicClock};
use crate::indicator::StatusLed;
use crate::link::{ConnectionState, ConnectionSupervisor, Credentials};

pub const STATUS_CHECK_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset,
    Status,
    Scan,
    Help,
}

impl Command {
    /// Case-insensitive; anything unrecognised is `None`.
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim().to_lowercase().as_str() {
            "reset" => Some(Command::Reset),
            "status" => Some(Command::Status),
            "scan" => Some(Command::Scan),
            "help" => Some(Command::Help),
            _ => None,
        }
    }
}

/// Forwards lines from `reader` on a detached thread.
pub fn spawn_line_reader<R>(reader: R) -> Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub struct Console<W, P> {
    input: Receiver<String>,
    output: W,
    supervisor: ConnectionSupervisor,
    led: StatusLed<P>,
    running: Arc<AtomicBool>,
    clock: MonotonicClock,
}

impl<W: Write, P: OutputPin> Console<W, P> {
    pub fn new(
        input: Receiver<String>,
        output: W,
        supervisor: ConnectionSupervisor,
        led: StatusLed<P>,
        running: Arc<AtomicBool>,
    ) -> Console<W, P> {
        Console {
            input,
            output,
            supervisor,
            led,
            running,
            clock: MonotonicClock::new(),
        }
    }

    /// Blocks for the next trimmed line, giving up once stopped.
    fn read_line(&mut self) -> Result<String, anyhow::Error> {
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv_timeout(LOOP_INTERVAL) {
                Ok(line) => return Ok(line.trim().to_string()),
                Err(RecvTimeoutError::Timeout) => {
                    self.led.update(self.supervisor.state(), self.clock.now_ms());
                }
                Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Console input closed"),
            }
        }
        anyhow::bail!("Console stopped")
    }

    fn prompt(&mut self, text: &str) -> Result<String, anyhow::Error> {
        write!(self.output, "{text}")?;
        self.output.flush()?;
        self.read_line()
    }

    pub fn prompt_credentials(&mut self) -> Result<Credentials, anyhow::Error> {
        writeln!(self.output, "\nEnter WiFi credentials:")?;

        let ssid = loop {
            let ssid = self.prompt("SSID: ")?;
            if !ssid.is_empty() {
                break ssid;
            }
        };
        writeln!(self.output, "{ssid}")?;

        let password = self.prompt("Password: ")?;
        writeln!(self.output, "********")?;

        let mut question = "Does your network require a username? (y/n): ";
        let username = loop {
            let answer = self.prompt(question)?;
            writeln!(self.output, "{answer}")?;
            match answer.to_lowercase().as_str() {
                "y" | "yes" => {
                    let username = self.prompt("Username: ")?;
                    writeln!(self.output, "{username}")?;
                    break Some(username);
                }
                "n" | "no" => break None,
                _ => question = "Please enter 'y' or 'n': ",
            }
        };

        Ok(Credentials {
            ssid,
            password,
            username,
        })
    }

    pub fn connect(&mut self, credentials: &Credentials) -> Result<(), anyhow::Error> {
        writeln!(self.output, "\nConnecting to WiFi network: {}", credentials.ssid)?;
        if credentials.username.is_some() {
            writeln!(self.output, "Using enterprise WiFi authentication")?;
        }

        match self.supervisor.connect(credentials, &mut self.led) {
            Ok(()) => {
                writeln!(self.output, "WiFi connection established!")?;
                self.print_status()
            }
            Err(e) => {
                log::warn!("{e:#}");
                writeln!(self.output, "Failed to connect to WiFi. Please check credentials.")?;
                writeln!(self.output, "Type 'reset' to enter new credentials.")?;
                Ok(())
            }
        }
    }

    pub fn handle(&mut self, command: Command) -> Result<(), anyhow::Error> {
        match command {
            Command::Reset => {
                writeln!(self.output, "Resetting WiFi credentials...")?;
                if let Err(e) = self.supervisor.disconnect() {
                    log::warn!("{e:#}");
                }
                let credentials = self.prompt_credentials()?;
                self.connect(&credentials)
            }
            Command::Status => self.print_status(),
            Command::Scan => self.print_scan(),
            Command::Help => self.print_help(),
        }
    }

    pub fn print_status(&mut self) -> Result<(), anyhow::Error> {
        if self.supervisor.state() != ConnectionState::Connected {
            writeln!(self.output, "Not connected to WiFi")?;
            return Ok(());
        }

        let info = self.supervisor.link().info()?;
        let unknown = || "unknown".to_string();
        writeln!(self.output, "SSID: {}", info.ssid.unwrap_or_else(unknown))?;
        writeln!(self.output, "IP Address: {}", info.ip_address.unwrap_or_else(unknown))?;
        match info.signal {
            Some(signal) => writeln!(self.output, "Signal strength: {signal}")?,
            None => writeln!(self.output, "Signal strength: unknown")?,
        }
        writeln!(self.output, "MAC address: {}", info.mac_address.unwrap_or_else(unknown))?;
        Ok(())
    }

    pub fn print_scan(&mut self) -> Result<(), anyhow::Error> {
        writeln!(self.output, "Scanning for networks...")?;

        let networks = self.supervisor.link().scan()?;
        if networks.is_empty() {
            writeln!(self.output, "No networks found")?;
            return Ok(());
        }

        writeln!(self.output, "Found {} networks:", networks.len())?;
        for (i, network) in networks.iter().enumerate() {
            writeln!(
                self.output,
                "{}) {} ({}) - {}",
                i + 1,
                network.ssid,
                network.signal,
                network.security
            )?;
        }
        writeln!(self.output)?;
        Ok(())
    }

    pub fn print_help(&mut self) -> Result<(), anyhow::Error> {
        writeln!(self.output, "Available commands:")?;
        writeln!(self.output, "  reset  - Enter new WiFi credentials")?;
        writeln!(self.output, "  status - Show WiFi connection status")?;
        writeln!(self.output, "  scan   - Scan for available networks")?;
        writeln!(self.output, "  help   - Show this help message")?;
        Ok(())
    }

    /// Polls the link once, announcing genuine transitions.
    pub fn check_link(&mut self) -> Result<(), anyhow::Error> {
        let before = self.supervisor.state();
        if self.supervisor.poll() {
            match self.supervisor.state() {
                ConnectionState::Connected => {
                    writeln!(self.output, "WiFi connection established!")?;
                    self.print_status()?;
                }
                _ if before == ConnectionState::Connected => {
                    writeln!(self.output, "WiFi connection lost!")?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), anyhow::Error> {
        writeln!(self.output, "Hive Monitor WiFi console")?;
        writeln!(self.output, "-------------------------")?;

        let credentials = self.prompt_credentials()?;
        self.connect(&credentials)?;
        writeln!(self.output, "Type 'help' for available commands.")?;

        let mut cadence = Cadence::new(STATUS_CHECK_INTERVAL_MS);
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv_timeout(LOOP_INTERVAL) {
                Ok(line) => {
                    if let Some(command) = Command::parse(&line) {
                        self.handle(command)?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(LOOP_INTERVAL),
            }

            let now_ms = self.clock.now_ms();
            if cadence.due(now_ms) {
                self.check_link()?;
            }
            self.led.update(self.supervisor.state(), now_ms);
        }

        Ok(())
    }
}
