//! Plain HTTP transport
//!
//! A HEAD request answers `check_size`; a GET streamed through a fixed-size
//! buffer answers `fetch`. Partial downloads are never resumed: every fetch
//! starts the staging file from zero.

use super::{create_staging, ByteSink, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use uplift_types::{Resource, TransferSettings};

/// Downloads resources with ordinary HTTP requests
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    buffer_size: usize,
}

impl HttpTransport {
    /// Create a transport with a client configured from `settings`
    pub fn new(settings: &TransferSettings) -> Result<Self, TransportError> {
        Ok(Self::with_client(build_client(settings)?, settings.buffer_size))
    }

    /// Create a transport around an existing client
    pub fn with_client(client: Client, buffer_size: usize) -> Self {
        Self {
            client,
            buffer_size: buffer_size.max(1),
        }
    }
}

/// Build the reqwest client shared by the HTTP and peer transports
pub fn build_client(settings: &TransferSettings) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .user_agent(settings.user_agent.as_str())
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
    if settings.read_timeout_secs > 0 {
        builder = builder.read_timeout(Duration::from_secs(settings.read_timeout_secs));
    }
    Ok(builder.build()?)
}

/// Fail with `TransportError::Status` unless the response succeeded
pub(crate) fn ensure_success(url: &url::Url, status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
        let response = self.client.head(resource.remote.clone()).send().await?;
        ensure_success(&resource.remote, response.status())?;

        let size = content_length(&response);
        debug!("Probed {}: size={:?}", resource.remote, size);
        Ok(size)
    }

    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        let response = self.client.get(resource.remote.clone()).send().await?;
        ensure_success(&resource.remote, response.status())?;

        info!(
            "Downloading resource {} (size: {:?})",
            resource.remote,
            content_length(&response)
        );

        let mut file = create_staging(&resource.staging).await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(Box::pin(body));
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await?;
            if on_bytes(read as u64).is_break() {
                debug!("Download of {} aborted by caller", resource.remote);
                return Err(TransportError::Aborted);
            }
        }

        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resource(server: &MockServer, dir: &TempDir, name: &str) -> Resource {
        let url = url::Url::parse(&format!("{}/{}", server.uri(), name)).unwrap();
        Resource::new(url, dir.path().join(name))
    }

    fn transport(buffer_size: usize) -> HttpTransport {
        let settings = TransferSettings {
            buffer_size,
            ..TransferSettings::default()
        };
        HttpTransport::new(&settings).unwrap()
    }

    #[tokio::test]
    async fn test_check_size_reads_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/app.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1000]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let size = transport(4096)
            .check_size(&resource(&server, &dir, "app.jar"))
            .await
            .unwrap();
        assert_eq!(size, Some(1000));
    }

    #[tokio::test]
    async fn test_check_size_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = transport(4096)
            .check_size(&resource(&server, &dir, "missing.jar"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 404, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_fetch_writes_staging_in_fixed_chunks() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/app.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let rsrc = resource(&server, &dir, "app.jar");
        let mut chunks = Vec::new();
        transport(256)
            .fetch(&rsrc, &mut |n| {
                chunks.push(n);
                ControlFlow::Continue(())
            })
            .await
            .unwrap();

        assert_eq!(chunks.iter().sum::<u64>(), 1000);
        assert!(chunks.iter().all(|&n| n <= 256));
        assert_eq!(std::fs::read(&rsrc.staging).unwrap(), body);
        assert!(!rsrc.local.exists());
    }

    #[tokio::test]
    async fn test_fetch_truncates_existing_staging_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let rsrc = resource(&server, &dir, "data.bin");
        std::fs::write(&rsrc.staging, b"stale content that is longer").unwrap();

        transport(4096)
            .fetch(&rsrc, &mut |_| ControlFlow::Continue(()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&rsrc.staging).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_fetch_stops_when_sink_breaks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let rsrc = resource(&server, &dir, "big.bin");
        let err = transport(512)
            .fetch(&rsrc, &mut |_| ControlFlow::Break(()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Aborted));
    }

    #[tokio::test]
    async fn test_fetch_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = transport(4096)
            .fetch(&resource(&server, &dir, "x.bin"), &mut |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
    }
}
