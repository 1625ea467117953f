#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{
    config::TimingConfig,
    http_client::{
        device_http_client, device_url, handle_http_response, looks_like_html, snippet,
        upload_http_client,
    },
    services::program::{UploadPayload, custom_program_filename},
};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trait_variant::make;

/// One-shot check whether the device answers at an address
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait ReachabilityProbe {
    /// Never fails; errors and timeouts count as unreachable
    async fn probe(&self, ip: &str) -> bool;
}

/// Program file stored on the device
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RemoteProgram {
    pub filename: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadRequest {
    /// Endpoint override from the settings
    pub endpoint: String,
    /// Form field name from the settings; the device takes raw JSON bodies
    pub field_name: String,
    /// Local export file name, used in messages
    pub filename: String,
    pub payload: UploadPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub message: String,
    pub device_filename: String,
}

/// Program file operations on the device
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait DeviceClient {
    async fn list_programs(&self, ip: &str) -> Result<Vec<RemoteProgram>>;
    async fn delete_program(&self, ip: &str, filename: &str) -> Result<()>;
    async fn upload_program(&self, ip: &str, request: &UploadRequest) -> Result<UploadOutcome>;
}

/// HTTP client for the device's file API
#[derive(Clone)]
pub struct AgoDeviceClient {
    probe_client: Client,
    command_client: Client,
    upload_client: Client,
}

impl AgoDeviceClient {
    pub const PROGRAMS_ENDPOINT: &str = "/api/files/programs/custom";

    const BODY_SNIPPET_CHARS: usize = 180;
    const PAYLOAD_SNIPPET_CHARS: usize = 360;

    pub fn new(timing: &TimingConfig) -> Result<Self> {
        Ok(Self {
            probe_client: device_http_client(timing.probe_timeout)?,
            command_client: device_http_client(timing.command_timeout)?,
            upload_client: upload_http_client(timing.upload_timeout)?,
        })
    }

    fn program_url(ip: &str, filename: &str) -> String {
        device_url(ip, &format!("{}/{filename}", Self::PROGRAMS_ENDPOINT))
    }

    /// Send one upload attempt; on failure returns a line describing it
    async fn try_upload(
        &self,
        ip: &str,
        method: Method,
        url: &str,
        body: &str,
    ) -> std::result::Result<(), String> {
        debug!(
            "{method} {url} payload: {}",
            snippet(body, Self::PAYLOAD_SNIPPET_CHARS)
        );

        let res = self
            .upload_client
            .request(method.clone(), url)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/json")
            .header("Origin", format!("http://{ip}"))
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| format!("{method} {url} -> {e}"))?;

        let status = res.status();
        let text = res.text().await.unwrap_or_default();

        if status.is_success() && !looks_like_html(&text) {
            Ok(())
        } else {
            Err(format!(
                "{method} {url} -> HTTP {status} ({})",
                snippet(&text, Self::BODY_SNIPPET_CHARS)
            ))
        }
    }
}

/// First string value among `keys`
fn text_field(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Program listing as returned by the device
///
/// Accepts an array of file names, an array of objects, or either of those
/// wrapped as `{"files": [...]}`.
fn parse_program_list(body: &str) -> Result<Vec<RemoteProgram>> {
    let value: Value = serde_json::from_str(body).context("failed to parse program list")?;

    let entries = match &value {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("files") {
            Some(Value::Array(entries)) => entries,
            _ => bail!("failed to parse program list: missing files array"),
        },
        _ => bail!("failed to parse program list: unexpected JSON shape"),
    };

    Ok(entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(RemoteProgram {
                filename: name.clone(),
                display_name: name.clone(),
            }),
            Value::Object(_) => {
                let filename = text_field(entry, &["filename", "file", "name"])?;
                let display_name = text_field(entry, &["display_name", "displayName", "name"])
                    .unwrap_or_else(|| filename.clone());
                Some(RemoteProgram {
                    filename,
                    display_name,
                })
            }
            _ => None,
        })
        .collect())
}

impl ReachabilityProbe for AgoDeviceClient {
    async fn probe(&self, ip: &str) -> bool {
        let url = device_url(ip, "");

        match self.probe_client.get(&url).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("probe {url} failed: {e}");
                false
            }
        }
    }
}

impl DeviceClient for AgoDeviceClient {
    async fn list_programs(&self, ip: &str) -> Result<Vec<RemoteProgram>> {
        let url = device_url(ip, Self::PROGRAMS_ENDPOINT);
        info!("GET {url}");

        let res = self
            .command_client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("failed to send GET request to {url}"))?;

        let body = handle_http_response(res, &format!("GET {url}")).await?;
        parse_program_list(&body)
    }

    async fn delete_program(&self, ip: &str, filename: &str) -> Result<()> {
        let url = Self::program_url(ip, filename);
        info!("DELETE {url}");

        let res = self
            .command_client
            .delete(&url)
            .header("Accept", "application/json")
            .header("Origin", format!("http://{ip}"))
            .send()
            .await
            .with_context(|| format!("failed to reach device at {ip}"))?;

        handle_http_response(res, &format!("DELETE {filename}")).await?;
        Ok(())
    }

    async fn upload_program(&self, ip: &str, request: &UploadRequest) -> Result<UploadOutcome> {
        let body =
            serde_json::to_string(&request.payload).context("failed to serialize upload payload")?;
        let device_filename = custom_program_filename();
        let url = Self::program_url(ip, &device_filename);
        info!("uploading {} as {device_filename}", request.filename);

        let mut attempts = Vec::new();

        for (method, via) in [(Method::POST, "via API"), (Method::PUT, "via API (PUT)")] {
            match self.try_upload(ip, method, &url, &body).await {
                Ok(()) => {
                    return Ok(UploadOutcome {
                        message: format!(
                            "Uploaded {} to AGO as {device_filename} {via}",
                            request.filename
                        ),
                        device_filename,
                    });
                }
                Err(attempt) => {
                    warn!("upload attempt failed: {attempt}");
                    attempts.push(attempt);
                }
            }
        }

        let endpoint = request.endpoint.trim();
        if !endpoint.is_empty() && endpoint != Self::PROGRAMS_ENDPOINT {
            let legacy_url = device_url(ip, endpoint);

            match self.try_upload(ip, Method::POST, &legacy_url, &body).await {
                Ok(()) => {
                    return Ok(UploadOutcome {
                        message: format!(
                            "Uploaded {} via compatibility endpoint {legacy_url}",
                            request.filename
                        ),
                        device_filename,
                    });
                }
                Err(attempt) => {
                    warn!("upload attempt failed: {attempt}");
                    attempts.push(attempt);
                }
            }
        }

        bail!("Upload failed. Tried: {}", attempts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod program_list {
        use super::*;

        #[test]
        fn accepts_bare_names() {
            let programs = parse_program_list(r#"["_P_C0_1.txt", "_P_C0_2.txt"]"#).unwrap();
            assert_eq!(programs.len(), 2);
            assert_eq!(programs[1].display_name, "_P_C0_2.txt");
        }

        #[test]
        fn accepts_objects_with_either_naming() {
            let programs = parse_program_list(
                r#"{"files": [
                    {"filename": "a.txt", "display_name": "HP5"},
                    {"filename": "b.txt", "displayName": "Tri-X"},
                    {"name": "c.txt"},
                    {"size": 3},
                    42
                ]}"#,
            )
            .unwrap();

            let names: Vec<_> = programs
                .iter()
                .map(|p| (p.filename.as_str(), p.display_name.as_str()))
                .collect();
            assert_eq!(names, [("a.txt", "HP5"), ("b.txt", "Tri-X"), ("c.txt", "c.txt")]);
        }

        #[test]
        fn rejects_other_shapes() {
            assert!(parse_program_list(r#"{"programs": []}"#).is_err());
            assert!(parse_program_list("<html></html>").is_err());
            assert!(parse_program_list("7").is_err());
        }
    }

    #[test]
    fn program_urls_live_under_custom_endpoint() {
        assert_eq!(
            AgoDeviceClient::program_url("10.10.10.1", "_P_C0_00ff00ff.txt"),
            "http://10.10.10.1/api/files/programs/custom/_P_C0_00ff00ff.txt"
        );
    }

    #[tokio::test]
    async fn unreachable_device_probes_false() {
        let timing = TimingConfig {
            probe_timeout: std::time::Duration::from_millis(200),
            ..TimingConfig::default()
        };
        let client = AgoDeviceClient::new(&timing).unwrap();

        // port 9 on localhost refuses connections
        assert!(!client.probe("127.0.0.1:9").await);
    }
}
