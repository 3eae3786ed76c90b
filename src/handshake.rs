//! Remote-side handshake: authentication and the READY wait.
//!
//! A freshly dialed tunnel connection goes through two control phases before
//! it carries payload:
//!
//! 1. [`authenticate`]: send the auth frame (when a secret key is
//!    configured) and wait for the remote's verdict under a deadline.
//! 2. [`await_ready`]: consume control lines until `READY`, answering
//!    liveness probes (`PING` → `PONG`) along the way, and hand back any
//!    bytes that arrived after the `READY` terminator so the payload phase
//!    starts with nothing lost.
//!
//! Everything after `READY` is opaque; no control-line interpretation
//! happens once this module returns.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::TunnelError;
use crate::lines::LineBuffer;

/// The one frame the client ever sends during the control phase.
#[derive(Serialize)]
struct AuthFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    key: &'a str,
}

fn auth_ok_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"status"\s*:\s*"ok""#).expect("literal pattern"))
}

fn auth_fail_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"status"\s*:\s*"error""#).expect("literal pattern"))
}

/// Authenticates the connection against the remote.
///
/// With no secret key configured this is a no-op: the connection is
/// considered authenticated without any I/O. Otherwise a single JSON line
/// `{"type":"auth","key":"<secret>"}` is written and the remote's reply is
/// awaited under `deadline`.
///
/// Each received chunk is stripped and matched as one indicator: `AUTH_OK`,
/// `AUTH_SUCCESS`, or a `"status":"ok"` body mean success; `AUTH_FAIL` or a
/// `"status":"error"` body mean [`TunnelError::AuthRejected`]. Unrecognized
/// chunks are ignored and the wait continues.
///
/// The secret key is never logged and never appears in error values.
pub(crate) async fn authenticate<S>(
    remote: &mut S,
    secret_key: Option<&str>,
    deadline: Duration,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(key) = secret_key else {
        return Ok(());
    };

    let mut frame = serde_json::to_vec(&AuthFrame { kind: "auth", key })
        .map_err(|e| TunnelError::AuthTransport(Arc::from(e.to_string())))?;
    frame.push(b'\n');
    remote
        .write_all(&frame)
        .await
        .map_err(|e| TunnelError::AuthTransport(Arc::from(e.to_string())))?;

    match timeout(deadline, wait_for_indicator(remote)).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::AuthTimeout),
    }
}

async fn wait_for_indicator<S>(remote: &mut S) -> Result<(), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        let n = remote
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::AuthTransport(Arc::from(e.to_string())))?;
        if n == 0 {
            return Err(TunnelError::AuthTransport(Arc::from(
                "connection closed before an auth indicator arrived",
            )));
        }
        let text = String::from_utf8_lossy(&chunk[..n]);
        let text = text.trim();
        if text == "AUTH_OK" || text == "AUTH_SUCCESS" || auth_ok_pattern().is_match(text) {
            return Ok(());
        }
        if text == "AUTH_FAIL" || auth_fail_pattern().is_match(text) {
            return Err(TunnelError::AuthRejected);
        }
        // Anything else is noise; keep waiting for a definitive indicator.
    }
}

/// Waits for the `READY` control line.
///
/// `PING` lines are answered with `PONG\n` and dropped so they never reach
/// the payload path. Unrecognized lines stay buffered and count against the
/// 64 KiB cap; exceeding it fails the handshake. Returns the residue: every
/// byte received after the `READY` terminator, verbatim.
///
/// There is no deadline here; the remote may take arbitrarily long to pair
/// this connection with a visitor. The buffer cap bounds memory instead.
pub(crate) async fn await_ready<S>(remote: &mut S) -> Result<Bytes, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = remote.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::PrematureClose);
        }
        if lines.push(&chunk[..n]).is_err() {
            return Err(TunnelError::Protocol(Arc::from(
                "unexpected data before READY",
            )));
        }
        while let Some(line) = lines.peek_line() {
            match line.as_str() {
                "READY" => return Ok(lines.split_residue()),
                "PING" => {
                    remote.write_all(b"PONG\n").await?;
                    lines.consume_line();
                }
                _ => lines.skip_line(),
            }
        }
    }
}
