//! Remote hive API client
//!
//! The server keeps the canonical logs and tasks per hive. Everything the
//! assistant needs from it goes through the [`HiveApi`] trait so the store,
//! the dispatcher and the sync loop can be exercised without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Log entry as returned by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLog {
    pub id: i64,
    pub hive_id: i64,
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Task entry as returned by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: i64,
    pub hive_id: i64,
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Body of `POST /api/logs`
#[derive(Debug, Clone, Serialize)]
pub struct CreateLogRequest<'a> {
    #[serde(rename = "hiveID")]
    pub hive_id: i64,
    pub content: &'a str,
}

/// Errors talking to the hive API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {0}")]
    Status(u16),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Operations the assistant needs from the remote service
#[async_trait]
pub trait HiveApi: Send + Sync {
    /// Create a log
    ///
    /// Any 2xx is the acknowledgement. The created entry is returned when the
    /// body could be read as one.
    async fn create_log(&self, hive_id: i64, content: &str)
        -> Result<Option<RemoteLog>, ApiError>;

    /// Most recent log for a hive, `None` if it has none
    async fn last_log(&self, hive_id: i64) -> Result<Option<RemoteLog>, ApiError>;

    /// Most recent task for a hive, `None` if it has none
    async fn last_task(&self, hive_id: i64) -> Result<Option<RemoteTask>, ApiError>;

    /// Whether the server can be reached at all
    async fn is_reachable(&self) -> bool;
}

/// [`HiveApi`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpHiveApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHiveApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        hive_id: i64,
    ) -> Result<Option<T>, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("hive_id", hive_id)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ApiError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl HiveApi for HttpHiveApi {
    async fn create_log(
        &self,
        hive_id: i64,
        content: &str,
    ) -> Result<Option<RemoteLog>, ApiError> {
        let response = self
            .client
            .post(self.url("/api/logs"))
            .json(&CreateLogRequest { hive_id, content })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        match response.json::<RemoteLog>().await {
            Ok(log) => {
                debug!(remote_id = log.id, hive_id, "log created on server");
                Ok(Some(log))
            }
            Err(e) => {
                warn!(hive_id, error = %e, "log accepted but response body unreadable");
                Ok(None)
            }
        }
    }

    async fn last_log(&self, hive_id: i64) -> Result<Option<RemoteLog>, ApiError> {
        self.get_optional("/api/logs/last", hive_id).await
    }

    async fn last_task(&self, hive_id: i64) -> Result<Option<RemoteTask>, ApiError> {
        self.get_optional("/api/tasks/last", hive_id).await
    }

    async fn is_reachable(&self) -> bool {
        // Any HTTP answer means the network path is up
        self.client.get(self.url("/api/hives/")).send().await.is_ok()
    }
}

/// In-memory [`HiveApi`] used by tests across the crate
#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Default)]
    pub struct FakeHiveApi {
        pub logs: Mutex<HashMap<i64, RemoteLog>>,
        pub tasks: Mutex<HashMap<i64, RemoteTask>>,
        /// Uploads with this content are rejected by the "server"
        pub rejected_content: Mutex<HashSet<String>>,
        /// Every accepted upload, in order
        pub created: Mutex<Vec<(i64, String)>>,
        pub offline: Mutex<bool>,
        /// Uploads hang until the caller gives up
        pub stalled: Mutex<bool>,
        pub upload_attempts: AtomicUsize,
        pub reachability_checks: AtomicUsize,
    }

    impl FakeHiveApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn go_offline(&self) {
            *self.offline.lock() = true;
        }

        pub fn stall_uploads(&self) {
            *self.stalled.lock() = true;
        }

        pub fn uploads_attempted(&self) -> usize {
            self.upload_attempts.load(Ordering::SeqCst)
        }

        pub fn reachability_checked(&self) -> usize {
            self.reachability_checks.load(Ordering::SeqCst)
        }

        pub fn reject(&self, content: &str) {
            self.rejected_content.lock().insert(content.to_string());
        }

        pub fn with_last_log(self, hive_id: i64, content: &str) -> Self {
            self.logs.lock().insert(
                hive_id,
                RemoteLog {
                    id: 1,
                    hive_id,
                    content: content.to_string(),
                    created_at: String::new(),
                    updated_at: String::new(),
                },
            );
            self
        }

        pub fn with_last_task(self, hive_id: i64, content: &str) -> Self {
            self.tasks.lock().insert(
                hive_id,
                RemoteTask {
                    id: 1,
                    hive_id,
                    content: content.to_string(),
                    created_at: String::new(),
                    updated_at: String::new(),
                },
            );
            self
        }

        fn check_online(&self) -> Result<(), ApiError> {
            if *self.offline.lock() {
                Err(ApiError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl HiveApi for FakeHiveApi {
        async fn create_log(
            &self,
            hive_id: i64,
            content: &str,
        ) -> Result<Option<RemoteLog>, ApiError> {
            self.upload_attempts.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let stalled = *self.stalled.lock();
            if stalled {
                std::future::pending::<()>().await;
            }
            if self.rejected_content.lock().contains(content) {
                return Err(ApiError::Status(500));
            }
            let mut created = self.created.lock();
            created.push((hive_id, content.to_string()));
            Ok(Some(RemoteLog {
                id: created.len() as i64,
                hive_id,
                content: content.to_string(),
                created_at: String::new(),
                updated_at: String::new(),
            }))
        }

        async fn last_log(&self, hive_id: i64) -> Result<Option<RemoteLog>, ApiError> {
            self.check_online()?;
            Ok(self.logs.lock().get(&hive_id).cloned())
        }

        async fn last_task(&self, hive_id: i64) -> Result<Option<RemoteTask>, ApiError> {
            self.check_online()?;
            Ok(self.tasks.lock().get(&hive_id).cloned())
        }

        async fn is_reachable(&self) -> bool {
            self.reachability_checks.fetch_add(1, Ordering::SeqCst);
            !*self.offline.lock()
        }
    }

    /// HTTP server that answers every request with `201 Created` and `body`
    ///
    /// Returns the base URL and a counter of POSTs received.
    pub async fn spawn_created_responder(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let posts = Arc::new(AtomicUsize::new(0));

        let counter = posts.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    while !request_complete(&request) {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    if request.starts_with(b"POST") {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }

                    let response = format!(
                        "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), posts)
    }

    /// Headers received and the declared body fully read
    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        raw.len() >= end + 4 + length
    }
}
