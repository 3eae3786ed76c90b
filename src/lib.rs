//! tnnlr Tunnel Agent Library
//!
//! This library lets Rust applications expose a local HTTP(S) server through
//! a tnnlr rendezvous service. It acquires an endpoint from the control
//! plane, then keeps a pool of authenticated TCP tunnel connections open to
//! it; each connection serves one visitor end to end, forwarding bytes to
//! and from the local server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐         ┌─────────────────┐
//! │     Visitor     │◄───────►│   Rendezvous    │◄───────►│   This Agent    │
//! │                 │  HTTPS  │     Server      │   TCP   │  (TunnelPool)   │
//! └─────────────────┘         └─────────────────┘         └─────────────────┘
//!                                                                  │
//!                                                                  ▼
//!                                                         ┌─────────────────┐
//!                                                         │  Local Service  │
//!                                                         │  (localhost:N)  │
//!                                                         └─────────────────┘
//! ```
//!
//! Each tunnel connection starts in a line-oriented control phase (an auth
//! frame answered by the server, `PING` probes answered with `PONG`) until
//! the server sends `READY`. From then on the connection is an opaque byte
//! pipe spliced against a freshly opened local connection. When either side
//! closes, the pool dials a replacement; retries are infinite.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tnnlr::{endpoint, LocalConnectConfig, TunnelConfig, TunnelPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tnnlr::TunnelError> {
//!     let api_url = "https://tunnel.example.com/api/tunnels";
//!     let endpoint = endpoint::acquire(api_url, None, 10, 3, Duration::from_secs(5)).await?;
//!     println!("tunnel available at {}", endpoint.url);
//!
//!     let mut config = TunnelConfig::new(
//!         endpoint.remote_host(api_url)?,
//!         endpoint.port,
//!         LocalConnectConfig::new("localhost", 8080),
//!     );
//!     if let Some(key) = endpoint.secret_key.clone() {
//!         config = config.with_secret_key(key);
//!     }
//!
//!     let pool = TunnelPool::new(config, endpoint.max_conn_count);
//!     pool.run().await;
//!     Ok(())
//! }
//! ```
//!
//! # Host header rewriting
//!
//! When the configured local host is anything other than `localhost` or
//! `127.0.0.1`, the first HTTP `Host:` header of each forwarded stream is
//! rewritten to it, so name-based virtual hosts answer correctly. The
//! rewrite happens at most once per connection.
//!
//! # Request observation
//!
//! Attach a [`flume`] channel with
//! [`TunnelConfig::with_request_observer`] to be notified of the
//! method/path of requests entering the tunnel. Observation is best-effort
//! and never alters the forwarded bytes.

pub mod endpoint;
pub mod error;
pub mod local;
pub mod pool;
pub mod session;

mod handshake;
mod host_rewrite;
mod lines;
mod trace_id;

pub use endpoint::Endpoint;
pub use error::TunnelError;
pub use local::LocalConnectConfig;
pub use pool::TunnelPool;
pub use session::{run_session, RequestInfo, SessionPhase, SessionStats, TunnelConfig};
