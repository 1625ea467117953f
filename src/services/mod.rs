//! Connectivity, persistence and the device operations built on them
//!
//! The long-lived components here own their state and talk to the outside
//! only through the capability traits in [`crate::wifi_client`],
//! [`crate::ago_device_client`] and [`crate::recipe_store`].

pub mod coalescer;
pub mod connectivity;
pub mod persistence;
pub mod program;
pub mod ssid;
pub mod timer;
pub mod upload;
