use ago_recipes::{
    ago_device_client::{AgoDeviceClient, DeviceClient, ReachabilityProbe, UploadRequest},
    config::TimingConfig,
    model::Recipe,
    notice::{Notice, NoticeBus},
    recipe_store::{RecipeStore, SqliteRecipeStore},
    services::{
        connectivity::{ConnectionState, ConnectivityStatus},
        persistence::PersistenceEngine,
        program::build_upload_payload,
        upload::UploadService,
    },
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
};

#[derive(Clone, Debug)]
struct Recorded {
    method: String,
    path: String,
    cookie: Option<String>,
    body: String,
}

type Responder = fn(&str, &str) -> (u16, &'static str);

struct MockDevice {
    /// `host:port` to use as the device address
    ip: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: JoinHandle<()>,
}

impl MockDevice {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Minimal HTTP/1.1 server answering each request through `respond`
async fn start_mock_device(respond: Responder) -> MockDevice {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock device");
    let ip = listener
        .local_addr()
        .expect("mock device address")
        .to_string();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let recorded = recorded.clone();

            tokio::spawn(async move {
                let mut reader = BufReader::new(&mut stream);

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.is_err() {
                    return;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut content_length = 0;
                let mut cookie = None;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        return;
                    }
                    if line.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap_or(0);
                        } else if name.eq_ignore_ascii_case("cookie") {
                            cookie = Some(value.trim().to_string());
                        }
                    }
                }

                let mut body = vec![0; content_length];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                let body = String::from_utf8_lossy(&body).to_string();

                let (status, response_body) = respond(&method, &path);
                recorded.lock().expect("requests lock").push(Recorded {
                    method,
                    path,
                    cookie,
                    body,
                });

                let response = format!(
                    "HTTP/1.1 {status} MOCK\r\nContent-Type: application/json\r\nSet-Cookie: session=ago; Path=/\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
                    response_body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    MockDevice { ip, requests, task }
}

fn client() -> AgoDeviceClient {
    client_with_probe_timeout(Duration::from_secs(2))
}

fn client_with_probe_timeout(probe_timeout: Duration) -> AgoDeviceClient {
    let timing = TimingConfig {
        probe_timeout,
        command_timeout: Duration::from_secs(2),
        upload_timeout: Duration::from_secs(2),
        ..TimingConfig::default()
    };
    AgoDeviceClient::new(&timing).expect("failed to create device client")
}

fn recipe() -> Recipe {
    let mut recipe = Recipe::blank("r1".to_string(), "2024-01-01T00:00:00.000Z");
    recipe.name = "HP5 in Rodinal".to_string();
    recipe.film_stock = "HP5".to_string();
    recipe.developer = "Rodinal".to_string();
    recipe.dilution = "1+50".to_string();
    recipe
}

fn upload_request(endpoint: &str) -> UploadRequest {
    UploadRequest {
        endpoint: endpoint.to_string(),
        field_name: "json".to_string(),
        filename: "HP5_Rodinal.json".to_string(),
        payload: build_upload_payload(&recipe()),
    }
}

#[tokio::test]
async fn probe_reports_reachable_device() {
    let device = start_mock_device(|_, _| (200, "<html>AGO</html>")).await;

    assert!(client().probe(&device.ip).await);
    assert_eq!(device.requests()[0].path, "/");
}

#[tokio::test]
async fn silent_device_is_unreachable_after_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind silent device");
    let ip = listener.local_addr().expect("silent device address").to_string();
    // accepts connections and never answers
    let silent = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });

    let started = Instant::now();
    let reachable = client_with_probe_timeout(Duration::from_millis(200))
        .probe(&ip)
        .await;

    assert!(!reachable);
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    silent.abort();
}

#[tokio::test]
async fn error_status_means_unreachable() {
    let device = start_mock_device(|_, _| (503, "busy")).await;

    assert!(!client().probe(&device.ip).await);
    assert_eq!(device.requests().len(), 1);
}

#[tokio::test]
async fn refused_connection_means_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind port");
    let ip = listener.local_addr().expect("port address").to_string();
    drop(listener);

    assert!(!client().probe(&ip).await);
}

#[tokio::test]
async fn list_programs_reads_custom_folder() {
    let device = start_mock_device(|_, _| {
        (
            200,
            r#"{"files": [{"filename": "_P_C0_1a2b3c4d.txt", "displayName": "HP5"}]}"#,
        )
    })
    .await;

    let programs = client().list_programs(&device.ip).await.unwrap();

    assert_eq!(programs.len(), 1);
    assert_eq!(programs[0].filename, "_P_C0_1a2b3c4d.txt");
    assert_eq!(programs[0].display_name, "HP5");
    let requests = device.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/api/files/programs/custom");
}

#[tokio::test]
async fn delete_program_reports_device_rejection() {
    let device = start_mock_device(|_, path| {
        if path.ends_with("/known.txt") {
            (200, "{}")
        } else {
            (404, r#"{"error": "not found"}"#)
        }
    })
    .await;
    let client = client();

    client.delete_program(&device.ip, "known.txt").await.unwrap();
    let err = client
        .delete_program(&device.ip, "missing.txt")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"), "{err:#}");
    let requests = device.requests();
    assert_eq!(requests[0].method, "DELETE");
    assert_eq!(requests[0].path, "/api/files/programs/custom/known.txt");
}

#[tokio::test]
async fn upload_falls_back_to_put() {
    let device = start_mock_device(|method, _| match method {
        "POST" => (405, "method not allowed"),
        _ => (200, r#"{"ok": true}"#),
    })
    .await;

    let outcome = client()
        .upload_program(&device.ip, &upload_request("/api/files/programs/custom"))
        .await
        .unwrap();

    assert!(outcome.message.ends_with("via API (PUT)"), "{}", outcome.message);
    assert!(outcome.device_filename.starts_with("_P_C0_"));
    assert!(outcome.device_filename.ends_with(".txt"));

    let requests = device.requests();
    let methods: Vec<_> = requests.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(methods, ["POST", "PUT"]);
    assert_eq!(requests[0].cookie, None);
    assert_eq!(requests[1].cookie.as_deref(), Some("session=ago"));
    assert_eq!(
        requests[1].path,
        format!("/api/files/programs/custom/{}", outcome.device_filename)
    );

    let payload: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(payload["name"], "HP5");
    assert_eq!(payload["designator"], "C2");
}

#[tokio::test]
async fn html_answers_count_as_failed_uploads() {
    let device = start_mock_device(|_, _| (200, "<!DOCTYPE html><html></html>")).await;

    let err = client()
        .upload_program(&device.ip, &upload_request("/upload"))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("Upload failed. Tried:"), "{message}");
    let paths: Vec<_> = device.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths.len(), 3);
    assert_eq!(paths[2], "/upload");
}

#[tokio::test]
async fn connected_upload_is_recorded_in_history() {
    let device = start_mock_device(|_, _| (200, r#"{"ok": true}"#)).await;

    let notices = NoticeBus::default();
    let mut notice_rx = notices.subscribe();
    let engine = PersistenceEngine::new(
        SqliteRecipeStore::open_in_memory().unwrap(),
        notices.clone(),
        Duration::from_millis(300),
    );
    engine.load_settings().await;
    engine.update_setting("ago_ip", &device.ip).await;

    let recipe = recipe();
    engine.store().insert_recipe(&recipe).await.unwrap();

    let (_state, status) = watch::channel(ConnectivityStatus {
        state: ConnectionState::Connected,
        ..ConnectivityStatus::default()
    });
    let uploads = UploadService::new(engine.clone(), client(), status, notices);

    let outcome = uploads.upload(&recipe).await.unwrap();

    assert!(outcome.message.ends_with("via API"), "{}", outcome.message);
    let history = engine.store().fetch_uploads().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].filename, outcome.device_filename);
    assert_eq!(history[0].display_name, "HP5 in Rodinal");
    assert_eq!(
        notice_rx.try_recv().unwrap(),
        Notice::success("Recipe uploaded to AGO")
    );
}
