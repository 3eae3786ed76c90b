//! Tunnel session lifecycle.
//!
//! A session is one full-duplex connection to the remote rendezvous plus its
//! paired connection to the local server. It moves through an explicit phase
//! progression:
//!
//! ```text
//! Dial → Auth → AwaitReady → LocalDial → Splicing → Closed
//! ```
//!
//! and terminates with a single `Result`: statistics on a clean remote
//! close, or the first error encountered. Any failure closes both sockets
//! before the session returns.
//!
//! Once `READY` is observed the remote carries opaque payload. Splicing runs
//! as two independent copy loops: remote→local (optionally through the
//! `Host:` header rewrite, seeded with the post-READY residue) and
//! local→remote. A clean local close only ends the upload loop; the session
//! stays up until the remote closes, which is also when visitors stop
//! arriving on this connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::TunnelError;
use crate::handshake;
use crate::host_rewrite::HostRewrite;
use crate::local::{self, LocalConnectConfig, LocalStream};

/// Default deadline for the authentication exchange.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(5000);

const COPY_BUFFER: usize = 16 * 1024;

/// An HTTP-style request line observed on the remote stream.
///
/// Extraction is best-effort: only the first whitespace-delimited token pair
/// of a chunk is inspected, and a request line fragmented across chunks is
/// not reassembled. Observation never consumes or alters the payload.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

/// Configuration for a tunnel session (and for a pool of them).
#[derive(Clone)]
pub struct TunnelConfig {
    /// Hostname of the remote rendezvous endpoint
    pub remote_host: String,

    /// Port of the remote rendezvous endpoint
    pub remote_port: u16,

    /// The local leg each session pairs with
    pub local: LocalConnectConfig,

    /// Secret key for the auth frame; `None` skips authentication entirely
    pub secret_key: Option<String>,

    /// Deadline for the authentication exchange
    pub auth_timeout: Duration,

    /// Optional sink receiving observed request lines
    pub request_tx: Option<flume::Sender<RequestInfo>>,
}

impl TunnelConfig {
    /// Creates a configuration with the default auth timeout and no
    /// authentication or request observer.
    pub fn new(remote_host: impl Into<String>, remote_port: u16, local: LocalConnectConfig) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local,
            secret_key: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            request_tx: None,
        }
    }

    /// Sets the secret key sent in the auth frame.
    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// Overrides the authentication deadline.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Attaches a request observer.
    pub fn with_request_observer(mut self, tx: flume::Sender<RequestInfo>) -> Self {
        self.request_tx = Some(tx);
        self
    }
}

// The secret key must never reach log output, so Debug redacts it.
impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("local", &self.local)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}

/// Phase of a tunnel session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Dial,
    Auth,
    AwaitReady,
    LocalDial,
    Splicing,
    Closed,
}

/// Statistics from a completed tunnel session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Bytes received from the remote and delivered to the local server
    pub bytes_downloaded: u64,
    /// Bytes received from the local server and sent to the remote
    pub bytes_uploaded: u64,
}

fn advance(phase: &mut SessionPhase, next: SessionPhase) {
    tracing::debug!(from = ?phase, to = ?next, "session phase");
    *phase = next;
}

/// Runs one tunnel session to completion.
///
/// Dials the remote with TCP keep-alive enabled, authenticates, waits for
/// `READY`, opens the local connection, and splices until either side
/// terminates. Returns transfer statistics on a clean remote close. No
/// socket is left open after this returns.
pub async fn run_session(config: &TunnelConfig) -> Result<SessionStats, TunnelError> {
    let mut phase = SessionPhase::Dial;

    let mut remote = TcpStream::connect((config.remote_host.as_str(), config.remote_port))
        .await
        .map_err(|e| TunnelError::remote_dial(&e))?;
    enable_keepalive(&remote);
    advance(&mut phase, SessionPhase::Auth);

    if let Err(err) =
        handshake::authenticate(&mut remote, config.secret_key.as_deref(), config.auth_timeout)
            .await
    {
        close_remote(&mut remote).await;
        return Err(err);
    }
    advance(&mut phase, SessionPhase::AwaitReady);

    let residue = match handshake::await_ready(&mut remote).await {
        Ok(residue) => residue,
        Err(err) => {
            close_remote(&mut remote).await;
            return Err(err);
        }
    };
    advance(&mut phase, SessionPhase::LocalDial);

    let local = match local::connect(&config.local).await {
        Ok(local) => local,
        Err(err) => {
            close_remote(&mut remote).await;
            return Err(err);
        }
    };
    advance(&mut phase, SessionPhase::Splicing);

    let result = splice(config, remote, local, residue).await;
    advance(&mut phase, SessionPhase::Closed);
    result
}

async fn close_remote(remote: &mut TcpStream) {
    let _ = remote.shutdown().await;
}

fn enable_keepalive(remote: &TcpStream) {
    if let Err(err) = socket2::SockRef::from(remote).set_keepalive(true) {
        tracing::debug!(error = %err, "failed to enable TCP keep-alive");
    }
}

/// Whether the forwarded stream needs its `Host:` header rewritten.
///
/// A plain loopback target answers regardless of the header; any other host
/// gets the configured name substituted in.
fn needs_host_rewrite(host: &str) -> bool {
    host != "localhost" && host != "127.0.0.1"
}

/// Splices the two connections until either side terminates.
///
/// Terminal conditions:
/// - Remote EOF completes the session normally; the upload loop is torn
///   down with it.
/// - Any remote or local error fails the session; dropping the loops closes
///   whatever the error left open.
/// - Local EOF only finishes the upload loop. The remote write half is
///   parked (not dropped) so no FIN reaches the remote while the download
///   direction is still live.
async fn splice(
    config: &TunnelConfig,
    remote: TcpStream,
    local: LocalStream,
    residue: Bytes,
) -> Result<SessionStats, TunnelError> {
    let rewrite = if needs_host_rewrite(&config.local.host) {
        Some(HostRewrite::new(&config.local.host))
    } else {
        None
    };

    let downloaded = Arc::new(AtomicU64::new(0));
    let uploaded = Arc::new(AtomicU64::new(0));

    let (remote_read, remote_write) = remote.into_split();
    let (local_read, local_write) = tokio::io::split(local);

    let down = copy_remote_to_local(
        remote_read,
        local_write,
        rewrite,
        residue,
        config.request_tx.clone(),
        downloaded.clone(),
    );
    let up = copy_local_to_remote(local_read, remote_write, uploaded.clone());
    tokio::pin!(down);
    tokio::pin!(up);

    let mut parked_remote_write = None;
    let mut local_done = false;

    loop {
        tokio::select! {
            down_result = &mut down => {
                down_result?;
                break;
            }
            up_result = &mut up, if !local_done => {
                match up_result {
                    Ok(write_half) => {
                        tracing::debug!("local connection closed; waiting for remote close");
                        parked_remote_write = Some(write_half);
                        local_done = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    drop(parked_remote_write);
    Ok(SessionStats {
        bytes_downloaded: downloaded.load(Ordering::Relaxed),
        bytes_uploaded: uploaded.load(Ordering::Relaxed),
    })
}

/// Forwards remote payload into the local connection in arrival order,
/// starting with the post-READY residue.
async fn copy_remote_to_local(
    mut remote: OwnedReadHalf,
    mut local: WriteHalf<LocalStream>,
    mut rewrite: Option<HostRewrite>,
    residue: Bytes,
    observer: Option<flume::Sender<RequestInfo>>,
    transferred: Arc<AtomicU64>,
) -> Result<(), TunnelError> {
    if !residue.is_empty() {
        forward_chunk(&mut local, residue, &mut rewrite, &observer, &transferred).await?;
    }
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = remote.read(&mut buf).await.map_err(remote_splice_error)?;
        if n == 0 {
            tracing::debug!("remote connection closed");
            break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        forward_chunk(&mut local, chunk, &mut rewrite, &observer, &transferred).await?;
    }
    // Signal EOF to the local server.
    let _ = local.shutdown().await;
    Ok(())
}

async fn forward_chunk(
    local: &mut WriteHalf<LocalStream>,
    chunk: Bytes,
    rewrite: &mut Option<HostRewrite>,
    observer: &Option<flume::Sender<RequestInfo>>,
    transferred: &AtomicU64,
) -> Result<(), TunnelError> {
    observe_request(&chunk, observer);
    let chunk = match rewrite {
        Some(rewrite) => rewrite.transform(chunk),
        None => chunk,
    };
    transferred.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    local.write_all(&chunk).await?;
    local.flush().await?;
    Ok(())
}

/// Forwards local bytes to the remote. A clean local EOF hands the remote
/// write half back to the caller instead of dropping (and thus closing) it.
async fn copy_local_to_remote(
    mut local: ReadHalf<LocalStream>,
    mut remote: OwnedWriteHalf,
    transferred: Arc<AtomicU64>,
) -> Result<OwnedWriteHalf, TunnelError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = local.read(&mut buf).await?;
        if n == 0 {
            return Ok(remote);
        }
        transferred.fetch_add(n as u64, Ordering::Relaxed);
        remote.write_all(&buf[..n]).await?;
    }
}

fn remote_splice_error(err: std::io::Error) -> TunnelError {
    if err.kind() == std::io::ErrorKind::ConnectionRefused {
        TunnelError::remote_dial(&err)
    } else {
        TunnelError::from(err)
    }
}

fn request_line_pattern() -> &'static regex::bytes::Regex {
    static RE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::bytes::Regex::new(r"^(\w+) (\S+)").expect("literal pattern"))
}

fn observe_request(chunk: &[u8], observer: &Option<flume::Sender<RequestInfo>>) {
    let Some(tx) = observer else { return };
    if let Some(caps) = request_line_pattern().captures(chunk) {
        let info = RequestInfo {
            method: String::from_utf8_lossy(&caps[1]).into_owned(),
            path: String::from_utf8_lossy(&caps[2]).into_owned(),
        };
        let _ = tx.try_send(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Local server that captures everything it receives until EOF.
    async fn spawn_capture_local() -> (u16, oneshot::Receiver<Vec<u8>>) {
        let (listener, port) = bind().await;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            socket.read_to_end(&mut data).await.unwrap();
            let _ = tx.send(data);
        });
        (port, rx)
    }

    fn config(remote_port: u16, local_port: u16) -> TunnelConfig {
        TunnelConfig::new(
            "127.0.0.1",
            remote_port,
            LocalConnectConfig::new("127.0.0.1", local_port),
        )
    }

    #[test]
    fn test_rewrite_only_for_non_local_hosts() {
        assert!(!needs_host_rewrite("localhost"));
        assert!(!needs_host_rewrite("127.0.0.1"));
        assert!(needs_host_rewrite("internal.example"));
    }

    #[test]
    fn test_secret_key_redacted_in_debug() {
        let cfg = config(1, 2).with_secret_key("hunter2");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_happy_path_no_auth_no_rewrite() {
        let payload: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket.write_all(b"READY\n").await.unwrap();
            socket
                .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
        });
        let (local_port, captured) = spawn_capture_local().await;
        let (req_tx, req_rx) = flume::unbounded();
        let config = config(remote_port, local_port).with_request_observer(req_tx);

        let stats = run_session(&config).await.unwrap();
        assert_eq!(captured.await.unwrap(), payload);
        assert_eq!(stats.bytes_downloaded, payload.len() as u64);

        let req = req_rx.try_recv().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/a");
    }

    #[tokio::test]
    async fn test_auth_then_ready_with_ping_interleave() {
        let (remote_listener, remote_port) = bind().await;
        let remote_task = tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"{\"type\":\"auth\",\"key\":\"s\"}\n");
            socket.write_all(b"AUTH_OK").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"PING\nPING\nREADY\nDATA").await.unwrap();
            let mut pongs = vec![0u8; 10];
            socket.read_exact(&mut pongs).await.unwrap();
            assert_eq!(&pongs[..], b"PONG\nPONG\n");
        });
        let (local_port, captured) = spawn_capture_local().await;
        let config = config(remote_port, local_port).with_secret_key("s");

        let stats = run_session(&config).await.unwrap();
        assert_eq!(captured.await.unwrap(), b"DATA");
        assert_eq!(stats.bytes_downloaded, 4);
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_session() {
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (_socket, _) = remote_listener.accept().await.unwrap();
            // Accept but never reply.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        let config = config(remote_port, 1)
            .with_secret_key("s")
            .with_auth_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let err = run_session(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::AuthTimeout));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_host_rewrite_applied_during_splice() {
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket
                .write_all(b"GET / HTTP/1.1\r\nHost: public.example\r\n\r\n")
                .await
                .unwrap();
        });
        let remote = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
        let (local_port, captured) = spawn_capture_local().await;
        let local = local::connect(&LocalConnectConfig::new("127.0.0.1", local_port))
            .await
            .unwrap();
        // The configured local host drives the rewrite decision.
        let cfg = TunnelConfig::new(
            "127.0.0.1",
            remote_port,
            LocalConnectConfig::new("internal.example", local_port),
        );

        splice(&cfg, remote, local, Bytes::new()).await.unwrap();
        assert_eq!(
            captured.await.unwrap(),
            b"GET / HTTP/1.1\r\nHost: internal.example\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_residue_delivered_before_later_chunks() {
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"TAIL").await.unwrap();
        });
        let remote = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
        let (local_port, captured) = spawn_capture_local().await;
        let local = local::connect(&LocalConnectConfig::new("127.0.0.1", local_port))
            .await
            .unwrap();
        let cfg = config(remote_port, local_port);

        let stats = splice(&cfg, remote, local, Bytes::from_static(b"HEAD"))
            .await
            .unwrap();
        assert_eq!(captured.await.unwrap(), b"HEADTAIL");
        assert_eq!(stats.bytes_downloaded, 8);
    }

    #[tokio::test]
    async fn test_pre_ready_garbage_fails_protocol() {
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            let junk = vec![b'a'; 100_000];
            let _ = socket.write_all(&junk).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let config = config(remote_port, 1);

        let err = run_session(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_local_refused_closes_remote() {
        let (remote_listener, remote_port) = bind().await;
        let remote_task = tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket.write_all(b"READY\n").await.unwrap();
            // The session must close the remote socket on local failure.
            let mut buf = [0u8; 16];
            let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        });
        let (unused_listener, unused_port) = bind().await;
        drop(unused_listener);
        let config = config(remote_port, unused_port);

        let err = run_session(&config).await.unwrap_err();
        assert!(matches!(err, TunnelError::LocalDial { refused: true, .. }));
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_not_dialed_before_ready() {
        let (remote_listener, remote_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            // Liveness traffic only; READY never arrives.
            socket.write_all(b"PING\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        let (local_listener, local_port) = bind().await;
        let local_dialed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let dialed = local_dialed.clone();
        tokio::spawn(async move {
            let _ = local_listener.accept().await;
            dialed.store(true, Ordering::SeqCst);
        });
        let config = config(remote_port, local_port);

        let session = run_session(&config);
        tokio::pin!(session);
        let waited = tokio::time::timeout(Duration::from_millis(200), &mut session).await;
        assert!(waited.is_err(), "session must still be awaiting READY");
        assert!(!local_dialed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_upload_direction() {
        let (remote_listener, remote_port) = bind().await;
        let remote_task = tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket.write_all(b"READY\n").await.unwrap();
            let mut reply = vec![0u8; 4];
            socket.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..], b"pong");
        });
        // Local server that answers without waiting for EOF.
        let (local_listener, local_port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = local_listener.accept().await.unwrap();
            socket.write_all(b"pong").await.unwrap();
        });
        let config = config(remote_port, local_port);

        let stats = run_session(&config).await.unwrap();
        assert_eq!(stats.bytes_uploaded, 4);
        remote_task.await.unwrap();
    }
}
