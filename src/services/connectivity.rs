//! Connection to the device's access point.
//!
//! The manager polls the host adapter and the device address on a fixed
//! interval and publishes a [`ConnectivityStatus`] through a watch channel.
//! Explicit connect and disconnect requests arrive as [`LinkCommand`]s and are
//! handled between polls, so status is only ever written from one task.
//!
//! No failure here is fatal. Probe, read and join errors resolve to a state
//! plus, where the user asked for something, a notice.

use crate::{
    ago_device_client::ReachabilityProbe,
    config::{DeviceAddress, Settings},
    notice::{FailureKind, Notice, NoticeBus},
    services::ssid,
    wifi_client::WifiClient,
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub state: ConnectionState,
    /// Network the adapter was last seen on, empty if unknown
    pub current_name: String,
    /// Network left when connecting to the device, restored on disconnect
    pub previous_name: String,
    /// Wireless adapter, `None` when the host has none
    pub interface: Option<String>,
}

/// Settings the manager acts on
#[derive(Clone, Debug, PartialEq)]
pub struct LinkSettings {
    pub address: DeviceAddress,
    pub auto_reconnect: bool,
}

impl From<&Settings> for LinkSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            address: settings.device_address(),
            auto_reconnect: settings.auto_reconnect(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkCommand {
    Connect,
    Disconnect,
    UpdateSettings(LinkSettings),
    RefreshInterface,
}

/// What one poll found out about the adapter
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    NoAdapter,
    Network(String),
    ReadFailed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NameChange {
    Keep,
    Set(String),
    Clear,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    pub current_name: NameChange,
}

impl Observation {
    /// Whether the outcome depends on probing the device address
    pub fn needs_probe(&self, target_ssid: &str) -> bool {
        match self {
            Observation::Network(name) => !ssid::matches(name, target_ssid),
            Observation::NoAdapter | Observation::ReadFailed => true,
        }
    }

    /// Poll outcome; `reachable` only counts when [`Self::needs_probe`] holds
    pub fn transition(&self, target_ssid: &str, reachable: bool) -> Transition {
        let probed = if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        match self {
            Observation::NoAdapter => Transition {
                state: probed,
                current_name: if reachable {
                    NameChange::Keep
                } else {
                    NameChange::Clear
                },
            },
            Observation::Network(name) => Transition {
                state: if ssid::matches(name, target_ssid) {
                    ConnectionState::Connected
                } else {
                    probed
                },
                current_name: NameChange::Set(name.clone()),
            },
            Observation::ReadFailed => Transition {
                state: probed,
                current_name: NameChange::Clear,
            },
        }
    }
}

pub struct ConnectivityManager<W, P> {
    wifi: W,
    probe: P,
    notices: NoticeBus,
    settings: LinkSettings,
    status: watch::Sender<ConnectivityStatus>,
    missing_adapter_reported: bool,
}

impl<W, P> ConnectivityManager<W, P>
where
    W: WifiClient,
    P: ReachabilityProbe,
{
    pub fn new(wifi: W, probe: P, notices: NoticeBus, settings: LinkSettings) -> Self {
        let (status, _) = watch::channel(ConnectivityStatus::default());

        Self {
            wifi,
            probe,
            notices,
            settings,
            status,
            missing_adapter_reported: false,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    pub fn set_settings(&mut self, settings: LinkSettings) {
        debug!("link settings updated");
        self.settings = settings;
    }

    fn interface(&self) -> Option<String> {
        self.status.borrow().interface.clone()
    }

    fn update(&self, modify: impl FnOnce(&mut ConnectivityStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            modify(status);

            if before.state != status.state {
                info!("connection state: {:?} -> {:?}", before.state, status.state);
            }
            before != *status
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.update(|status| status.state = state);
    }

    fn connected(&self, message: &str) {
        self.set_state(ConnectionState::Connected);
        self.notices.publish(Notice::success(message));
    }

    /// Detect the wireless adapter; a missing adapter is reported once
    pub async fn refresh_interface(&mut self) {
        let interface = match self.wifi.interface().await {
            Ok(interface) => interface,
            Err(e) => {
                warn!("failed to detect wireless interface: {e:#}");
                None
            }
        };

        match &interface {
            None if !self.missing_adapter_reported => {
                self.missing_adapter_reported = true;
                self.notices.publish(Notice::failure(
                    FailureKind::ConfigurationMissing,
                    "WiFi interface not detected. Make sure WiFi is enabled.",
                ));
            }
            None => {}
            Some(_) => self.missing_adapter_reported = false,
        }

        self.update(|status| status.interface = interface);
    }

    /// One poll of adapter and device
    pub async fn tick(&mut self) {
        let target = self.settings.address.clone();

        let observation = match self.interface() {
            None => Observation::NoAdapter,
            Some(interface) => match self.wifi.current_network(&interface).await {
                Ok(name) => Observation::Network(name),
                Err(e) => {
                    debug!("failed to read current network: {e:#}");
                    Observation::ReadFailed
                }
            },
        };

        let reachable =
            observation.needs_probe(&target.ssid) && self.probe.probe(&target.ip).await;
        let transition = observation.transition(&target.ssid, reachable);

        self.update(|status| {
            status.state = transition.state;
            match transition.current_name {
                NameChange::Keep => {}
                NameChange::Set(name) => status.current_name = name,
                NameChange::Clear => status.current_name.clear(),
            }
        });
    }

    /// Join the device's access point unless it is already reachable
    ///
    /// A successful join leaves the state at `Connecting`; the next poll
    /// confirms the connection.
    pub async fn connect(&mut self) {
        debug!("connect requested");
        let target = self.settings.address.clone();

        let Some(interface) = self.interface() else {
            if self.probe.probe(&target.ip).await {
                self.connected("AGO is reachable");
            } else {
                self.notices.publish(Notice::failure(
                    FailureKind::ConfigurationMissing,
                    "WiFi interface not found",
                ));
            }
            return;
        };

        let current = self.status().current_name;
        if ssid::matches(&current, &target.ssid) {
            self.connected("Already connected to AGO");
            return;
        }
        if self.probe.probe(&target.ip).await {
            self.connected("AGO is reachable");
            return;
        }

        self.update(|status| {
            if !current.is_empty() {
                status.previous_name = current.clone();
            }
            status.state = ConnectionState::Connecting;
        });

        let join_error = match self
            .wifi
            .join(&interface, &target.ssid, &target.password)
            .await
        {
            Ok(()) => {
                self.notices.publish(Notice::success("Connected to AGO"));
                return;
            }
            Err(e) => e,
        };
        warn!("joining {} failed: {join_error:#}", target.ssid);

        // the join may have gone through despite the error
        match self.wifi.current_network(&interface).await {
            Ok(name) => {
                let joined = ssid::matches(&name, &target.ssid);
                self.update(|status| status.current_name = name);
                if joined {
                    self.connected("Connected to AGO");
                    return;
                }
            }
            Err(e) => debug!("failed to read current network after join: {e:#}"),
        }

        if self.probe.probe(&target.ip).await {
            self.connected("Connected to AGO");
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        self.notices.publish(Notice::failure(
            FailureKind::TransientNetwork,
            format!("Connection failed: {join_error:#}"),
        ));
    }

    /// Leave the device, rejoining the previous network when enabled
    pub async fn disconnect(&mut self) {
        let Some(interface) = self.interface() else {
            debug!("disconnect without wireless interface ignored");
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let previous = self.status().previous_name;

        if self.settings.auto_reconnect && !previous.is_empty() {
            match self.wifi.rejoin(&interface, &previous).await {
                Ok(()) => self
                    .notices
                    .publish(Notice::success(format!("Reconnected to {previous}"))),
                Err(e) => {
                    warn!("rejoining {previous} failed: {e:#}");
                    self.notices.publish(Notice::failure(
                        FailureKind::TransientNetwork,
                        "Failed to reconnect",
                    ));
                }
            }
        } else {
            self.notices.publish(Notice::info(
                "Disconnected from AGO. Reconnect to your WiFi manually.",
            ));
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Connect => self.connect().await,
            LinkCommand::Disconnect => self.disconnect().await,
            LinkCommand::UpdateSettings(settings) => {
                self.set_settings(settings);
                self.tick().await;
            }
            LinkCommand::RefreshInterface => {
                self.refresh_interface().await;
                self.tick().await;
            }
        }
    }

    /// Poll every `poll_interval` and serve commands until all senders are gone
    pub async fn run(mut self, poll_interval: Duration, mut commands: mpsc::Receiver<LinkCommand>) {
        self.refresh_interface().await;

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("connectivity command channel closed");
                        break;
                    }
                },
            }
        }
    }
}

impl<W, P> ConnectivityManager<W, P>
where
    W: WifiClient + Send + Sync + 'static,
    P: ReachabilityProbe + Send + Sync + 'static,
{
    const COMMAND_CAPACITY: usize = 8;

    /// Run the manager on its own task
    ///
    /// The task ends once every [`ConnectivityHandle`] is dropped.
    pub fn spawn(self, poll_interval: Duration) -> (ConnectivityHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(Self::COMMAND_CAPACITY);
        let handle = ConnectivityHandle {
            commands: tx,
            status: self.subscribe(),
        };

        (handle, tokio::spawn(self.run(poll_interval, rx)))
    }
}

/// Access to a spawned [`ConnectivityManager`]
#[derive(Clone)]
pub struct ConnectivityHandle {
    commands: mpsc::Sender<LinkCommand>,
    status: watch::Receiver<ConnectivityStatus>,
}

impl ConnectivityHandle {
    async fn send(&self, command: LinkCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .context("failed to send command: connectivity manager stopped")
    }

    pub async fn connect(&self) -> Result<()> {
        self.send(LinkCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(LinkCommand::Disconnect).await
    }

    pub async fn update_settings(&self, settings: LinkSettings) -> Result<()> {
        self.send(LinkCommand::UpdateSettings(settings)).await
    }

    pub async fn refresh_interface(&self) -> Result<()> {
        self.send(LinkCommand::RefreshInterface).await
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }
}
