use anyhow::{Context, Result, ensure};
use reqwest::{Client, Response};
use std::time::Duration;

/// Create an HTTP client for talking to the device
///
/// Every request made with the returned client fails once `timeout` elapses,
/// so a silent device cannot stall the caller.
///
/// # Arguments
/// * `timeout` - Total time allowed per request
pub fn device_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("failed to create device HTTP client")
}

/// Like [`device_http_client`], but keeps cookies the device sets
///
/// The device's file API may hand out a session cookie on the first upload
/// attempt that later attempts must send back.
pub fn upload_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .cookie_store(true)
        .build()
        .context("failed to create upload HTTP client")
}

/// Build an absolute URL on the device
///
/// Absolute `http(s)://` endpoints are used as given; anything else is
/// resolved against `http://<ip>/`.
pub fn device_url(ip: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        let normalized_path = endpoint.trim_start_matches('/');
        format!("http://{ip}/{normalized_path}")
    }
}

/// Whether a response body is an HTML page rather than an API answer
///
/// The device serves its web UI for unknown API paths with status 200.
pub fn looks_like_html(body: &str) -> bool {
    let lower = body.trim().to_lowercase();
    lower.contains("<!doctype html") || lower.contains("<html")
}

/// Handle HTTP response by checking status and extracting body
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "DELETE program")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}

/// Shorten a response body for logs and error messages.
pub fn snippet(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}
