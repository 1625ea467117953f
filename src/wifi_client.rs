#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
#[cfg(feature = "mock")]
use mockall::automock;
use std::{process::Output, time::Duration};
use tokio::{process::Command, time::timeout};
use trait_variant::make;

/// Host wireless adapter operations
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait WifiClient {
    /// Name of the wireless adapter, `None` if the host has none
    async fn interface(&self) -> Result<Option<String>>;
    /// Network the adapter is joined to, empty if it is not associated
    async fn current_network(&self, interface: &str) -> Result<String>;
    async fn join(&self, interface: &str, ssid: &str, password: &str) -> Result<()>;
    /// Join a network whose credentials the host already knows
    async fn rejoin(&self, interface: &str, ssid: &str) -> Result<()>;
}

/// [`WifiClient`] driving macOS `networksetup`
#[derive(Clone, Debug)]
pub struct NetworkSetupClient {
    program: String,
    command_timeout: Duration,
}

impl NetworkSetupClient {
    const PROGRAM: &str = "networksetup";

    pub fn new(command_timeout: Duration) -> Self {
        Self {
            program: Self::PROGRAM.to_string(),
            command_timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("{} {}", self.program, args.first().copied().unwrap_or_default());

        timeout(
            self.command_timeout,
            Command::new(&self.program).args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("{} {} timed out", self.program, args.join(" ")))?
        .with_context(|| format!("failed to run {}", self.program))
    }

    /// One `-setairportnetwork` attempt; `Ok(false)` when the tool reported failure
    async fn try_join(&self, interface: &str, ssid: &str, password: Option<&str>) -> Result<bool> {
        let mut args = vec!["-setairportnetwork", interface, ssid];
        args.extend(password);

        let output = self.run(&args).await?;
        let combined = format!(
            "{} {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        // the tool exits 0 even when joining fails, with the reason on stdout
        let accepted = join_accepted(output.status.success(), &combined);
        if !accepted {
            warn!("joining {ssid} failed: {}", combined.trim());
        }
        Ok(accepted)
    }
}

/// Device line of the first Wi-Fi hardware port in `-listallhardwareports` output
fn parse_interface(listing: &str) -> Option<String> {
    let mut in_wifi_port = false;

    for line in listing.lines() {
        if line.contains("Wi-Fi") || line.contains("AirPort") {
            in_wifi_port = true;
            continue;
        }
        if in_wifi_port {
            if let Some(device) = line.strip_prefix("Device:") {
                return Some(device.trim().to_string());
            }
            if line.starts_with("Hardware Port:") {
                in_wifi_port = false;
            }
        }
    }

    None
}

/// Network name from `-getairportnetwork` output
///
/// `Some("")` when the adapter is not associated, `None` when the output cannot
/// be interpreted.
fn parse_current_network(stdout: &str) -> Option<String> {
    let line = stdout.trim();
    let lower = line.to_lowercase();

    if lower.contains("not associated")
        || lower.contains("not a wi-fi interface")
        || lower.contains("error obtaining wireless information")
    {
        return Some(String::new());
    }

    line.split_once(':')
        .map(|(_, ssid)| ssid.trim().trim_matches('"').to_string())
}

fn join_accepted(success: bool, output: &str) -> bool {
    let lower = output.to_lowercase();
    let failed = lower.contains("could not find network")
        || lower.contains("failed to join")
        || lower.contains("error");

    (success && !failed) || lower.contains("already associated") || lower.contains("already connected")
}

impl WifiClient for NetworkSetupClient {
    async fn interface(&self) -> Result<Option<String>> {
        let output = self.run(&["-listallhardwareports"]).await?;
        let interface = parse_interface(&String::from_utf8_lossy(&output.stdout));

        match &interface {
            Some(name) => info!("wireless interface: {name}"),
            None => info!("no wireless interface found"),
        }
        Ok(interface)
    }

    async fn current_network(&self, interface: &str) -> Result<String> {
        let output = self.run(&["-getairportnetwork", interface]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if let Some(name) = parse_current_network(&stdout) {
            return Ok(name);
        }
        if output.status.success() {
            return Ok(String::new());
        }

        bail!(
            "failed to read current network: {} {}",
            stdout.trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    async fn join(&self, interface: &str, ssid: &str, password: &str) -> Result<()> {
        info!("joining {ssid} on {interface}");
        let password = (!password.is_empty()).then_some(password);

        if self.try_join(interface, ssid, password).await? {
            return Ok(());
        }

        // credentials may already be stored in the keychain
        if password.is_some() && self.try_join(interface, ssid, None).await? {
            return Ok(());
        }

        bail!("failed to join {ssid}")
    }

    async fn rejoin(&self, interface: &str, ssid: &str) -> Result<()> {
        info!("rejoining {ssid} on {interface}");

        if self.try_join(interface, ssid, None).await? {
            Ok(())
        } else {
            bail!("failed to reconnect to {ssid}")
        }
    }
}
