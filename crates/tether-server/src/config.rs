//! Server configuration.
//!
//! The reference firmware fixed these at compile time; here they are a plain
//! value threaded into [`Service::new`](crate::Service::new), with the same
//! defaults.

/// Default assembler capacity: largest single logical request payload.
pub const DEFAULT_ASSEMBLER_BUF_SIZE: usize = 4096;

/// Default cap on a sized response before the server reports
/// [`ErrorCode::ResponseTooLarge`](tether_proto::ErrorCode::ResponseTooLarge).
pub const DEFAULT_MAX_RESPONSE_PAYLOAD_SIZE: usize = 4096;

/// Default RPC timeout the server reports on a timeout query.
pub const DEFAULT_TIMEOUT_MS: u16 = 10_000;

/// Default advertised device name (used by name-bearing transports).
pub const DEFAULT_DEVICE_NAME: &str = "blerpc";

/// Peripheral service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest logical request payload the assembler accepts. Also reported
    /// to clients as `max_request_payload_size`.
    pub assembler_buf_size: usize,

    /// Largest response payload the dispatcher will produce.
    pub max_response_payload_size: usize,

    /// RPC timeout reported on a timeout control query, in milliseconds.
    pub timeout_ms: u16,

    /// Stack size for the dispatch worker thread. `None` uses the platform
    /// default.
    pub work_stack_size: Option<usize>,

    /// Name the transport advertises under.
    pub device_name: String,

    /// Hex-encoded 32-byte Ed25519 identity seed. `Some` enables the
    /// encrypted session layer and makes it mandatory for requests.
    pub identity_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            assembler_buf_size: DEFAULT_ASSEMBLER_BUF_SIZE,
            max_response_payload_size: DEFAULT_MAX_RESPONSE_PAYLOAD_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            work_stack_size: None,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            identity_key: None,
        }
    }
}
