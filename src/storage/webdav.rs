use super::StorageSink;
use crate::config::Config;
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Stores attachments on a WebDAV server.
pub struct WebDavSink {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    retry_count: u32,
}

impl WebDavSink {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
        retry_count: u32,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            retry_count: retry_count.max(1),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let url = config
            .webdav_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("WEBDAV_URL is not configured"))?;
        Self::new(
            url,
            config.webdav_username.clone(),
            config.webdav_password.clone(),
            Duration::from_secs(config.webdav_timeout_secs),
            config.webdav_retry_count,
        )
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends one request, retrying 5xx responses and transport failures with
    /// exponential backoff (1s, 2s, 4s, ...).
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<StatusCode, StorageError> {
        let url = self.url_for(path);
        let mut last_error = String::new();

        for attempt in 0..self.retry_count {
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(user) = &self.username {
                builder = builder.basic_auth(user, self.password.as_ref());
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            let retry_in = Duration::from_secs(1 << attempt);
            let last_attempt = attempt + 1 == self.retry_count;
            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    debug!("WebDAV: {} {} -> {}", method, path, status);
                    if status.is_server_error() && !last_attempt {
                        warn!(
                            "WebDAV: {} {} returned {} (attempt {}/{}), retrying in {:?}",
                            method,
                            path,
                            status,
                            attempt + 1,
                            self.retry_count,
                            retry_in
                        );
                        tokio::time::sleep(retry_in).await;
                        continue;
                    }
                    return Ok(status);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !last_attempt {
                        warn!(
                            "WebDAV: {} {} failed (attempt {}/{}): {}",
                            method,
                            path,
                            attempt + 1,
                            self.retry_count,
                            e
                        );
                        tokio::time::sleep(retry_in).await;
                    }
                }
            }
        }

        Err(StorageError::Request(last_error))
    }

    /// Creates `dir` and any missing parents.
    async fn ensure_collection(&self, dir: &str) -> Result<(), StorageError> {
        let mkcol = mkcol_method();
        let parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Ok(());
        }

        let full = format!("{}/", parts.join("/"));
        match self.request(mkcol.clone(), &full, None).await? {
            StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED => return Ok(()),
            StatusCode::CONFLICT => {}
            status => {
                return Err(StorageError::Status {
                    status: status.as_u16(),
                    path: full,
                })
            }
        }

        // 409: an intermediate collection is missing. Walk down from the top.
        for depth in 1..=parts.len() {
            let partial = format!("{}/", parts[..depth].join("/"));
            let status = self.request(mkcol.clone(), &partial, None).await?;
            if !matches!(status, StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED) {
                return Err(StorageError::Status {
                    status: status.as_u16(),
                    path: partial,
                });
            }
        }
        Ok(())
    }
}

fn mkcol_method() -> Method {
    Method::from_bytes(b"MKCOL").unwrap_or(Method::PUT)
}

#[async_trait]
impl StorageSink for WebDavSink {
    async fn put(&self, bytes: Bytes, logical_path: &str) -> Result<String, StorageError> {
        let path = logical_path.trim_start_matches('/');
        if let Some((dir, _)) = path.rsplit_once('/') {
            self.ensure_collection(dir).await?;
        }

        let status = self.request(Method::PUT, path, Some(bytes)).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!("WebDAV: stored {}", path);
                Ok(path.to_string())
            }
            status => Err(StorageError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            }),
        }
    }

    async fn check(&self) -> Result<(), StorageError> {
        let status = self.request(Method::HEAD, "", None).await?;
        // 404/405 still prove the server answered.
        if status.is_success()
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::METHOD_NOT_ALLOWED
        {
            Ok(())
        } else {
            Err(StorageError::Status {
                status: status.as_u16(),
                path: self.base_url.clone(),
            })
        }
    }
}
