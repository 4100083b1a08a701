//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum single frame size (1MB) - validates a single key:value block.
/// No legitimate AMI frame should come close (largest are Status/CoreShowChannels sweeps).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum total buffer size (4MB) - safety limit to prevent runaway memory.
/// Should hold several max frames + overhead. Indicates a bug if exceeded.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Protocol terminators. Asterisk frames with CRLF; the parser also
/// tolerates bare LF from relaying proxies.
pub const LINE_TERMINATOR: &str = "\r\n";
/// A blank line ends a frame.
pub const BLOCK_TERMINATOR: &str = "\r\n\r\n";

/// Greeting line sent by the server before any frame, e.g.
/// `Asterisk Call Manager/9.0.0`.
pub const BANNER_PREFIX: &str = "Asterisk Call Manager";

/// Frame key identifying a synchronous reply (`Response: Success|Error|Goodbye`).
pub const KEY_RESPONSE: &str = "Response";
/// Frame key identifying an unsolicited event (`Event: <name>`).
pub const KEY_EVENT: &str = "Event";
/// Correlation id echoed back on replies.
pub const KEY_ACTION_ID: &str = "ActionID";
/// Free-text detail on replies.
pub const KEY_MESSAGE: &str = "Message";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Per-action reply timeout in milliseconds
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 5000;

/// Pool acquire timeout in milliseconds
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5000;

/// Maximum number of queued events per connection before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;
