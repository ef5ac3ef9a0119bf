use std::time::Duration;

use pretty_hex::PrettyHex;
use tokio::time::Instant;
use tracing::trace;

/// Keeps track of when a connection last made progress. Every successful
/// read or write should [touch](Activity::touch) it.
#[derive(Debug, Clone, Copy)]
pub struct Activity {
    timeout: Duration,
    last: Instant,
}

impl Activity {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last = Instant::now();
    }

    /// When the connection is considered idle, unless touched again
    pub fn deadline(&self) -> Instant {
        self.last + self.timeout
    }

    pub fn is_idle(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Logs (at trace level) what we have buffered while waiting for more.
pub(crate) fn trace_partial(what: &'static str, buf: &[u8]) {
    trace!(
        "{what}: need more data. so far, we have:\n{:?}",
        &buf[..std::cmp::min(buf.len(), 128)].hex_dump()
    );
}
