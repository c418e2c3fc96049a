use crate::error::FetchError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::debug;

/// Downloads attachment bytes by URL.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Fetches `url`, refusing anything larger than `max_size` bytes.
    async fn fetch(&self, url: &str, max_size: u64) -> Result<Bytes, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AttachmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_size: u64) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(declared) = response.content_length() {
            check_size(declared, max_size)?;
        }

        let body = read_capped(response.bytes_stream(), max_size).await?;

        debug!("Fetcher: {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

/// Collects `stream`, giving up as soon as more than `limit` bytes arrive.
async fn read_capped<S, E>(stream: S, limit: u64) -> Result<Bytes, FetchError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Request(e.to_string()))?;
        check_size((body.len() + chunk.len()) as u64, limit)?;
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn check_size(size: u64, limit: u64) -> Result<(), FetchError> {
    if size > limit {
        return Err(FetchError::TooLarge { size, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_size() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(
            check_size(11, 10),
            Err(FetchError::TooLarge { size: 11, limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_read_capped_stops_at_first_oversize_chunk() {
        let pulled = std::sync::atomic::AtomicUsize::new(0);
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
            Ok(Bytes::from_static(b"ijkl")),
        ])
        .inspect(|_| {
            pulled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let err = read_capped(chunks, 6).await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { size: 8, limit: 6 }));
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_capped_joins_chunks_within_limit() {
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]);
        assert_eq!(read_capped(chunks, 4).await.unwrap(), Bytes::from_static(b"abcd"));

        let failing = futures::stream::iter(vec![Err::<Bytes, _>(std::io::Error::other("reset"))]);
        assert!(matches!(
            read_capped(failing, 4).await,
            Err(FetchError::Request(_))
        ));
    }
}
