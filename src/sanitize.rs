//! Error sanitization and audit routing.
//!
//! Terminal failures surface to callers as a generic message, a stable
//! machine-readable code, and an opaque correlation reference. The
//! unredacted detail (host, credentials, raw server text) goes only to an
//! internal [`AuditSink`], keyed by the same reference.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;
use uuid::Uuid;

/// User-facing error classification.
///
/// Stable codes and generic messages; no instance data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transport open or login handshake failed.
    ConnectionFailure,
    /// Connect or acquire did not complete in time.
    ConnectionTimeout,
    /// The server rejected the credentials.
    AuthenticationFailure,
    /// I/O failure on an established connection.
    NetworkError,
    /// The supplied configuration is unusable.
    InvalidConfiguration,
    /// The server returned an error response.
    ActionExecutionFailure,
    /// No reply to an action within the timeout.
    ActionTimeout,
    /// The server refused the action for lack of privilege.
    PermissionDenied,
    /// A required action parameter was missing or malformed.
    InvalidParameter,
    /// The pool could not supply a connection.
    PoolExhausted,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "AMI_CONNECTION_FAILURE",
            ErrorKind::ConnectionTimeout => "AMI_CONNECTION_TIMEOUT",
            ErrorKind::AuthenticationFailure => "AMI_AUTH_FAILURE",
            ErrorKind::NetworkError => "AMI_NETWORK_ERROR",
            ErrorKind::InvalidConfiguration => "AMI_INVALID_CONFIG",
            ErrorKind::ActionExecutionFailure => "AMI_ACTION_FAILED",
            ErrorKind::ActionTimeout => "AMI_ACTION_TIMEOUT",
            ErrorKind::PermissionDenied => "AMI_PERMISSION_DENIED",
            ErrorKind::InvalidParameter => "AMI_INVALID_PARAMETER",
            ErrorKind::PoolExhausted => "AMI_POOL_EXHAUSTED",
        }
    }

    /// Generic human message. Deliberately free of hosts, credentials,
    /// and raw server text.
    pub fn generic_message(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "could not establish a connection to the server",
            ErrorKind::ConnectionTimeout => "timed out waiting for a connection",
            ErrorKind::AuthenticationFailure => "authentication with the server failed",
            ErrorKind::NetworkError => "a network error occurred",
            ErrorKind::InvalidConfiguration => "the client configuration is invalid",
            ErrorKind::ActionExecutionFailure => "the server rejected the requested action",
            ErrorKind::ActionTimeout => "the action did not complete in time",
            ErrorKind::PermissionDenied => "the action was not permitted",
            ErrorKind::InvalidParameter => "a required action parameter is missing or invalid",
            ErrorKind::PoolExhausted => "no connection was available",
        }
    }

    /// Whether the executor may retry this failure on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailure
                | ErrorKind::ConnectionTimeout
                | ErrorKind::NetworkError
                | ErrorKind::ActionTimeout
                | ErrorKind::PoolExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Opaque reference correlating a surfaced error with its audit record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationRef(String);

impl CorrelationRef {
    /// Generate a fresh reference.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The reference as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A context value attached to an error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Free-form text.
    Text(String),
    /// Numeric value (e.g. a port).
    Number(i64),
    /// Boolean flag.
    Flag(bool),
}

impl ContextValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Text(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Text(s)
    }
}

impl From<i64> for ContextValue {
    fn from(n: i64) -> Self {
        ContextValue::Number(n)
    }
}

impl From<u16> for ContextValue {
    fn from(n: u16) -> Self {
        ContextValue::Number(n as i64)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Flag(b)
    }
}

/// Diagnostic context: ordered key/value pairs.
pub type Context = Vec<(String, ContextValue)>;

/// Internal record of a terminal failure.
///
/// `raw_context` is unmasked and must only ever reach the audit sink;
/// `sanitized_context` is safe to expose.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Reference surfaced to the caller.
    pub reference: CorrelationRef,
    /// Context with sensitive fields masked.
    pub sanitized_context: Context,
    /// Full unmasked context.
    pub raw_context: Context,
}

/// Receives unredacted diagnostic detail. Implementations must treat
/// records as sensitive.
pub trait AuditSink: Send + Sync {
    /// Record a terminal failure with its full context.
    fn record_error(&self, record: &ErrorRecord);

    /// Record a listener that failed while handling an event.
    fn record_listener_failure(&self, category: &str, listener_index: usize, detail: &str);
}

/// Default sink that writes audit records to the `ami::audit` tracing
/// target at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_error(&self, record: &ErrorRecord) {
        error!(
            target: "ami::audit",
            code = record.kind.code(),
            reference = %record.reference,
            context = ?record.raw_context,
            "terminal failure"
        );
    }

    fn record_listener_failure(&self, category: &str, listener_index: usize, detail: &str) {
        error!(
            target: "ami::audit",
            category,
            listener_index,
            detail,
            "event listener failed"
        );
    }
}

/// Masks sensitive fields in diagnostic context.
#[derive(Debug, Clone, Copy)]
pub struct ErrorSanitizer {
    /// When set, the `port` field is fully masked even when it is a
    /// string, instead of following the first-and-last-character rule.
    /// Kept as a configurable special case.
    mask_port_fully: bool,
}

impl ErrorSanitizer {
    /// Create a sanitizer.
    pub fn new(mask_port_fully: bool) -> Self {
        Self { mask_port_fully }
    }

    /// Whether a context field name is classified sensitive.
    fn is_sensitive(key: &str) -> bool {
        const SENSITIVE: &[&str] = &[
            "username", "user", "password", "secret", "token", "credential", "host", "hostname",
            "address", "addr", "port",
        ];
        SENSITIVE.iter().any(|s| key.eq_ignore_ascii_case(s))
    }

    /// Mask a string value: first and last character kept, everything in
    /// between replaced. Strings of length <= 2 are fully masked.
    fn mask_string(value: &str) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= 2 {
            return "*".repeat(chars.len().max(1));
        }
        let mut out = String::with_capacity(chars.len());
        out.push(chars[0]);
        out.extend(std::iter::repeat('*').take(chars.len() - 2));
        out.push(chars[chars.len() - 1]);
        out
    }

    /// Apply the masking policy to one field.
    fn mask_value(&self, key: &str, value: &ContextValue) -> ContextValue {
        if !Self::is_sensitive(key) {
            return value.clone();
        }
        if key.eq_ignore_ascii_case("port") && self.mask_port_fully {
            return ContextValue::Text("***".to_string());
        }
        match value.as_text() {
            Some(s) => ContextValue::Text(Self::mask_string(s)),
            // Non-string sensitive values are fully masked.
            None => ContextValue::Text("***".to_string()),
        }
    }

    /// Build an [`ErrorRecord`] from raw context, generating the
    /// correlation reference and the sanitized copy.
    pub fn build_record(&self, kind: ErrorKind, raw_context: Context) -> ErrorRecord {
        let sanitized_context = raw_context
            .iter()
            .map(|(k, v)| (k.clone(), self.mask_value(k, v)))
            .collect();
        ErrorRecord {
            kind,
            reference: CorrelationRef::generate(),
            sanitized_context,
            raw_context,
        }
    }
}

impl Default for ErrorSanitizer {
    fn default() -> Self {
        Self::new(false)
    }
}
