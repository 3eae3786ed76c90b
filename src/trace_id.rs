use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Identifier attached to the tracing span of each tunnel connection.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TraceId(Arc<str>);

impl From<String> for TraceId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}
impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for TraceId {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generates the next connection ID.
///
/// Millisecond timestamp plus a process-local sequence number, so IDs stay
/// distinguishable across agent restarts.
pub(crate) fn next_trace_id() -> TraceId {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    let millis = Utc::now().timestamp_millis() as u64 & 0xffff_ffff;
    format!("{millis:x}-{seq:x}").into()
}
