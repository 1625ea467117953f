pub mod ago_device_client;
pub mod config;
pub mod http_client;
pub mod model;
pub mod notice;
pub mod recipe_store;
pub mod services;
pub mod wifi_client;
