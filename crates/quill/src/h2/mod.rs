//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>
//! HTTP semantics <https://httpwg.org/specs/rfc9110.html>

mod server;
pub use server::*;

mod encode;
pub(crate) mod types;
pub use types::{H2ConnectionError, H2Event, H2StreamError};

/// Settings we advertise, and limits on what the peer may send
#[derive(Debug, Clone)]
pub struct ServerConf {
    /// SETTINGS_HEADER_TABLE_SIZE: how large the peer's encoder may grow
    /// the table our decoder mirrors
    pub header_table_size: u32,

    /// SETTINGS_MAX_FRAME_SIZE, between 2^14 and 2^24-1
    pub max_frame_size: u32,

    /// SETTINGS_MAX_HEADER_LIST_SIZE, also enforced while decoding field
    /// blocks
    pub max_header_list_size: u32,

    /// SETTINGS_MAX_CONCURRENT_STREAMS. Advertised, not enforced.
    pub max_concurrent_streams: u32,

    /// SETTINGS_INITIAL_WINDOW_SIZE
    pub initial_window_size: u32,

    /// Largest request body accepted on a stream
    pub max_body_size: u64,

    /// Bodies larger than this are spooled to a temporary file
    pub body_memory_limit: usize,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_frame_size: 1 << 14,
            max_header_list_size: 256 * 1024,
            max_concurrent_streams: 100,
            initial_window_size: (1 << 16) - 1,
            max_body_size: 50 * 1024 * 1024,
            body_memory_limit: 64 * 1024,
        }
    }
}
