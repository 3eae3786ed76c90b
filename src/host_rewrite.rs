//! One-shot rewrite of the first HTTP `Host:` header in a forwarded stream.
//!
//! When the tunnel targets a local server that only answers to its own
//! hostname, the `Host:` header the visitor sent (the public tunnel domain)
//! has to be swapped for the configured local host. The header sits in the
//! first request segment, so the transform latches after one substitution
//! and degrades to passthrough; scanning later payload would risk rewriting
//! pipelined requests more than once.
//!
//! Known limitation: a `Host:` line that straddles a chunk boundary is not
//! rewritten and passes through with the original value.

use std::sync::OnceLock;

use bytes::Bytes;
use regex::bytes::Regex;

fn host_header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\r\n[Hh]ost: )\S+").expect("literal pattern"))
}

/// Streaming byte transform replacing the first `Host:` header value.
pub(crate) struct HostRewrite {
    /// Replacement template: `${1}` keeps the matched header prefix.
    replacement: Vec<u8>,
    replaced: bool,
}

impl HostRewrite {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            replacement: format!("${{1}}{host}").into_bytes(),
            replaced: false,
        }
    }

    /// Passes a chunk through, rewriting the header value at most once.
    pub(crate) fn transform(&mut self, chunk: Bytes) -> Bytes {
        if self.replaced {
            return chunk;
        }
        match host_header_pattern().replace(&chunk, self.replacement.as_slice()) {
            std::borrow::Cow::Borrowed(_) => chunk,
            std::borrow::Cow::Owned(rewritten) => {
                self.replaced = true;
                Bytes::from(rewritten)
            }
        }
    }
}
