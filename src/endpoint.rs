//! Control-plane endpoint acquisition.
//!
//! Before any tunnel can open, the agent asks the control-plane HTTP
//! service for a rendezvous endpoint: which host and port to dial, the
//! secret key to authenticate with, how many connections to keep open, and
//! the public URL visitors will use. [`acquire`] performs that POST with
//! bounded retries; the [`Endpoint`] record is immutable for the lifetime
//! of the pool built from it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// A rendezvous endpoint assigned by the control plane.
#[derive(Clone, Deserialize)]
pub struct Endpoint {
    /// Identifier assigned by the control plane
    #[serde(default)]
    pub id: Option<String>,

    /// Public URL visitors use to reach the tunnel
    pub url: String,

    /// Host to dial for tunnel connections; falls back to the
    /// control-plane host when absent
    #[serde(default)]
    pub host: Option<String>,

    /// Port to dial for tunnel connections
    pub port: u16,

    /// Secret key for the per-connection auth frame
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Number of tunnel connections the server allows
    #[serde(default = "default_max_conn_count")]
    pub max_conn_count: usize,
}

fn default_max_conn_count() -> usize {
    1
}

// The secret key must never reach log output, so Debug redacts it.
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("max_conn_count", &self.max_conn_count)
            .finish()
    }
}

impl Endpoint {
    /// The host tunnel sessions should dial: the endpoint's own `host`
    /// field, or the control-plane host when the record omits one.
    pub fn remote_host(&self, api_url: &str) -> Result<String, TunnelError> {
        if let Some(host) = &self.host {
            return Ok(host.clone());
        }
        let url = reqwest::Url::parse(api_url).map_err(|e| {
            TunnelError::EndpointAcquisition(Arc::from(format!("invalid control-plane URL: {e}")))
        })?;
        url.host_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                TunnelError::EndpointAcquisition(Arc::from("control-plane URL has no host"))
            })
    }
}

#[derive(Serialize)]
struct EndpointRequest {
    max_conn_count: usize,
}

/// Requests an endpoint from the control plane.
///
/// Performs an HTTP POST to `api_url` with an optional bearer token,
/// retrying up to `retry` attempts with `retry_delay` between them. The
/// request advertises how many connections the agent would like to open;
/// the response's `max_conn_count` is the server's answer.
pub async fn acquire(
    api_url: &str,
    api_key: Option<&str>,
    max_conn_count: usize,
    retry: u32,
    retry_delay: Duration,
) -> Result<Endpoint, TunnelError> {
    let client = reqwest::Client::new();
    let attempts = retry.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(retry_delay).await;
        }
        match request_endpoint(&client, api_url, api_key, max_conn_count).await {
            Ok(endpoint) => {
                tracing::info!(url = %endpoint.url, port = endpoint.port, "endpoint acquired");
                return Ok(endpoint);
            }
            Err(error) => {
                tracing::warn!(attempt, attempts, error = %error, "endpoint acquisition failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| TunnelError::EndpointAcquisition(Arc::from("no attempts were made"))))
}

async fn request_endpoint(
    client: &reqwest::Client,
    api_url: &str,
    api_key: Option<&str>,
    max_conn_count: usize,
) -> Result<Endpoint, TunnelError> {
    let mut request = client.post(api_url).json(&EndpointRequest { max_conn_count });
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TunnelError::EndpointAcquisition(Arc::from(format!(
            "server returned {status}: {}",
            body.trim()
        ))));
    }
    Ok(response.json::<Endpoint>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const ENDPOINT_BODY: &str = r#"{
        "id": "brave-otter",
        "url": "https://brave-otter.tunnel.test",
        "port": 31337,
        "secret_key": "k3y",
        "max_conn_count": 4
    }"#;

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..pos]).to_ascii_lowercase();
                let content_length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= pos + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    }

    /// One-connection-per-entry HTTP fixture returning canned responses and
    /// forwarding each captured request.
    async fn spawn_control_plane(
        responses: Vec<(&'static str, String)>,
    ) -> (String, flume::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                respond(&mut socket, status, &body).await;
            }
        });
        (format!("http://127.0.0.1:{port}/api/tunnels"), rx)
    }

    #[tokio::test]
    async fn test_acquire_parses_endpoint() {
        let (url, requests) =
            spawn_control_plane(vec![("200 OK", ENDPOINT_BODY.to_string())]).await;

        let endpoint = acquire(&url, Some("tok3n"), 10, 1, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(endpoint.url, "https://brave-otter.tunnel.test");
        assert_eq!(endpoint.port, 31337);
        assert_eq!(endpoint.secret_key.as_deref(), Some("k3y"));
        assert_eq!(endpoint.max_conn_count, 4);

        let request = requests.recv_async().await.unwrap();
        let head = request.to_ascii_lowercase();
        assert!(head.starts_with("post /api/tunnels"));
        assert!(head.contains("authorization: bearer tok3n"));
        assert!(request.contains("\"max_conn_count\":10"));
    }

    #[tokio::test]
    async fn test_acquire_retries_until_success() {
        let (url, requests) = spawn_control_plane(vec![
            ("500 Internal Server Error", "{\"error\":\"try later\"}".to_string()),
            ("200 OK", ENDPOINT_BODY.to_string()),
        ])
        .await;

        let endpoint = acquire(&url, None, 1, 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(endpoint.port, 31337);
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_surfaces_exhausted_retries() {
        let (url, _requests) = spawn_control_plane(vec![
            ("503 Service Unavailable", "busy".to_string()),
            ("503 Service Unavailable", "busy".to_string()),
        ])
        .await;

        let err = acquire(&url, None, 1, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::EndpointAcquisition(_)));
    }

    #[test]
    fn test_remote_host_prefers_endpoint_host() {
        let endpoint: Endpoint = serde_json::from_str(
            r#"{"url":"https://x.test","host":"edge7.tunnel.test","port":1}"#,
        )
        .unwrap();
        assert_eq!(
            endpoint.remote_host("https://tunnel.test/api").unwrap(),
            "edge7.tunnel.test"
        );
    }

    #[test]
    fn test_remote_host_falls_back_to_api_host() {
        let endpoint: Endpoint =
            serde_json::from_str(r#"{"url":"https://x.test","port":1}"#).unwrap();
        assert_eq!(
            endpoint.remote_host("https://tunnel.test/api").unwrap(),
            "tunnel.test"
        );
    }

    #[test]
    fn test_secret_key_redacted_in_debug() {
        let endpoint: Endpoint = serde_json::from_str(
            r#"{"url":"https://x.test","port":1,"secret_key":"hunter2"}"#,
        )
        .unwrap();
        assert!(!format!("{endpoint:?}").contains("hunter2"));
    }
}
