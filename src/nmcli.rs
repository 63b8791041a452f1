//! Wi-Fi link driven through NetworkManager's `nmcli` in terse mode.

use std::io::Write;
use std::process::{Child, Command, Stdio};

use anyhow::Context;

use crate::link::{ConnectionState, Credentials, Link, LinkInfo, NetworkInfo};

pub const NMCLI: &str = "nmcli";

/// Handed to `connection up` as its `passwd-file`; secrets are written to the
/// child's stdin and never appear on a command line.
pub const SECRETS_FROM_STDIN: &str = "/dev/stdin";

#[derive(Debug)]
pub struct NmcliLink {
    program: String,
    interface: String,
    pending: Option<Child>,
}

impl NmcliLink {
    pub fn new(interface: impl Into<String>) -> NmcliLink {
        NmcliLink {
            program: NMCLI.to_string(),
            interface: interface.into(),
            pending: None,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, anyhow::Error> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {} {}", self.program, args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} {} exited with {}: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn stop_pending(&mut self) {
        if let Some(mut child) = self.pending.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Reaps a finished join command, logging its failure.
    fn reap_pending(&mut self) {
        let Some(child) = self.pending.as_mut() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    log::warn!("{} connection up exited with {status}", self.program);
                }
                self.pending = None;
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("Failed to wait for {}: {e}", self.program);
                self.pending = None;
            }
        }
    }

    fn profile_exists(&self, name: &str) -> Result<bool, anyhow::Error> {
        let output = self.run(&["-t", "-f", "NAME", "connection", "show"])?;
        Ok(parse_connection_names(&output).iter().any(|existing| existing == name))
    }
}

impl Link for NmcliLink {
    /// Creates the profile named after the SSID on first use and updates it
    /// on every later attempt, then activates it in the background.
    fn begin(&mut self, credentials: &Credentials) -> Result<(), anyhow::Error> {
        self.stop_pending();

        let existing = self.profile_exists(&credentials.ssid)?;
        let args = profile_args(existing, &self.interface, credentials);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).with_context(|| {
            let action = if existing { "update" } else { "create" };
            format!("Failed to {action} connection profile {}", credentials.ssid)
        })?;

        let secrets = secrets_file(credentials);
        let mut command = Command::new(&self.program);
        command.args([
            "connection",
            "up",
            "id",
            credentials.ssid.as_str(),
            "ifname",
            self.interface.as_str(),
        ]);
        if secrets.is_some() {
            command.args(["passwd-file", SECRETS_FROM_STDIN]);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program))?;
        let stdin = child.stdin.take();
        self.pending = Some(child);

        if let (Some(secrets), Some(mut stdin)) = (secrets, stdin) {
            stdin
                .write_all(secrets.as_bytes())
                .with_context(|| format!("Failed to pass secrets to {}", self.program))?;
        }

        Ok(())
    }

    fn status(&mut self) -> ConnectionState {
        self.reap_pending();

        match self.run(&["-t", "-f", "DEVICE,STATE", "device"]) {
            Ok(output) => parse_device_state(&output, &self.interface),
            Err(e) => {
                log::warn!("{e:#}");
                ConnectionState::Disconnected
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), anyhow::Error> {
        self.stop_pending();
        self.run(&["device", "disconnect", &self.interface])?;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, anyhow::Error> {
        let output = self.run(&[
            "-t",
            "-f",
            "SSID,SIGNAL,SECURITY",
            "device",
            "wifi",
            "list",
            "ifname",
            &self.interface,
        ])?;
        Ok(parse_scan(&output))
    }

    fn info(&mut self) -> Result<LinkInfo, anyhow::Error> {
        let output = self.run(&[
            "-t",
            "-f",
            "GENERAL.CONNECTION,GENERAL.HWADDR,IP4.ADDRESS",
            "device",
            "show",
            &self.interface,
        ])?;
        let mut info = parse_device_show(&output);

        let active = self.run(&[
            "-t",
            "-f",
            "ACTIVE,SIGNAL",
            "device",
            "wifi",
            "list",
            "ifname",
            &self.interface,
        ]);
        if let Ok(output) = active {
            info.signal = output
                .lines()
                .map(split_terse)
                .find(|fields| fields.first().map(String::as_str) == Some("yes"))
                .and_then(|fields| fields.get(1).and_then(|signal| signal.parse().ok()));
        }

        Ok(info)
    }
}

/// Arguments that create (or, if `existing`, update) the profile named after
/// the SSID. Secrets are left out; see `secrets_file`.
pub fn profile_args(existing: bool, interface: &str, credentials: &Credentials) -> Vec<String> {
    let ssid = credentials.ssid.as_str();
    let mut args = if existing {
        vec!["connection", "modify", "id", ssid]
    } else {
        vec!["connection", "add", "type", "wifi", "con-name", ssid]
    };
    args.extend(["connection.interface-name", interface, "802-11-wireless.ssid", ssid]);

    match &credentials.username {
        Some(username) => args.extend([
            "802-11-wireless-security.key-mgmt",
            "wpa-eap",
            "802-1x.eap",
            "peap",
            "802-1x.phase2-auth",
            "mschapv2",
            "802-1x.identity",
            username.as_str(),
        ]),
        None if credentials.password.is_empty() => {
            if existing {
                args.extend(["remove", "802-11-wireless-security", "remove", "802-1x"]);
            }
        }
        None => {
            args.extend(["802-11-wireless-security.key-mgmt", "wpa-psk"]);
            if existing {
                args.extend(["remove", "802-1x"]);
            }
        }
    }

    args.into_iter().map(String::from).collect()
}

/// `passwd-file` contents for activating the profile, `None` for an open
/// network.
pub fn secrets_file(credentials: &Credentials) -> Option<String> {
    match &credentials.username {
        Some(_) => Some(format!("802-1x.password:{}\n", credentials.password)),
        None if credentials.password.is_empty() => None,
        None => Some(format!(
            "802-11-wireless-security.psk:{}\n",
            credentials.password
        )),
    }
}

pub fn parse_connection_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| split_terse(line).into_iter().next())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Splits one terse-mode line on unescaped `:`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    field.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

pub fn parse_device_state(output: &str, interface: &str) -> ConnectionState {
    let state = output
        .lines()
        .map(split_terse)
        .find(|fields| fields.first().map(String::as_str) == Some(interface))
        .and_then(|fields| fields.get(1).cloned())
        .unwrap_or_default();

    if state.starts_with("connected") {
        ConnectionState::Connected
    } else if state.starts_with("connecting") {
        ConnectionState::Connecting
    } else {
        ConnectionState::Disconnected
    }
}

pub fn parse_scan(output: &str) -> Vec<NetworkInfo> {
    output
        .lines()
        .map(split_terse)
        .filter_map(|fields| {
            let [ssid, signal, security] = fields.as_slice() else {
                return None;
            };
            if ssid.is_empty() {
                return None;
            }
            Some(NetworkInfo {
                ssid: ssid.clone(),
                signal: signal.parse().unwrap_or_default(),
                security: if security.is_empty() {
                    "None".to_string()
                } else {
                    security.clone()
                },
            })
        })
        .collect()
}

pub fn parse_device_show(output: &str) -> LinkInfo {
    let mut info = LinkInfo::default();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.replace("\\:", ":");
        if value.is_empty() || value == "--" {
            continue;
        }

        match key {
            "GENERAL.CONNECTION" => info.ssid = Some(value),
            "GENERAL.HWADDR" => info.mac_address = Some(value),
            key if key.starts_with("IP4.ADDRESS") && info.ip_address.is_none() => {
                let address = value.split('/').next().unwrap_or_default().to_string();
                info.ip_address = Some(address);
            }
            _ => {}
        }
    }

    info
}
