//! Resilient action execution: validation, retry with backoff, and
//! sanitized error surfacing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    action::Action,
    action::ActionResponse,
    config::ManagerConfig,
    error::AmiError,
    pool::ConnectionPool,
    sanitize::{AuditSink, Context, ContextValue, CorrelationRef, ErrorKind, ErrorSanitizer, TracingAuditSink},
};

/// User-facing execution failure.
///
/// Carries only a stable code, a generic message, and a correlation
/// reference; the unredacted detail is in the audit sink under the same
/// reference.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Opaque reference into the audit log.
    pub reference: CorrelationRef,
}

impl ExecutionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] (ref: {})",
            self.kind.generic_message(),
            self.kind.code(),
            self.reference
        )
    }
}

impl std::error::Error for ExecutionError {}

/// Required-parameter table, checked before any network I/O.
fn validate_parameters(action: &Action) -> Result<(), String> {
    let f = action.fields();
    let missing = |key: &str| f.get(key).map_or(true, str::is_empty);

    match action.name() {
        "Originate" => {
            if missing("Channel") {
                return Err("Originate requires Channel".to_string());
            }
            if missing("Exten") && missing("Application") {
                return Err("Originate requires Exten or Application".to_string());
            }
        }
        "Hangup" => {
            if missing("Channel") {
                return Err("Hangup requires Channel".to_string());
            }
        }
        "QueueAdd" | "QueueRemove" | "QueuePause" => {
            if missing("Queue") {
                return Err(format!("{} requires Queue", action.name()));
            }
            if missing("Interface") {
                return Err(format!("{} requires Interface", action.name()));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Map a low-level error to the user-facing taxonomy.
fn classify(err: &AmiError) -> ErrorKind {
    match err {
        AmiError::Io(_) | AmiError::ConnectionClosed | AmiError::NotConnected => {
            ErrorKind::NetworkError
        }
        AmiError::Timeout { .. } => ErrorKind::ActionTimeout,
        AmiError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailure,
        AmiError::PoolExhausted => ErrorKind::PoolExhausted,
        AmiError::PoolShutdown | AmiError::InvalidConfig { .. } => ErrorKind::InvalidConfiguration,
        AmiError::ActionFailed { message } => classify_server_message(message),
        AmiError::ProtocolError { .. }
        | AmiError::InvalidLine { .. }
        | AmiError::BufferOverflow { .. }
        | AmiError::QueueFull => ErrorKind::NetworkError,
    }
}

/// Map a failure to acquire a connection. The caller never held a
/// session here, so a timeout is a connect timeout, not an action
/// timeout.
fn classify_acquire(err: &AmiError) -> ErrorKind {
    match err {
        AmiError::Timeout { .. } => ErrorKind::ConnectionTimeout,
        AmiError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailure,
        AmiError::PoolExhausted => ErrorKind::PoolExhausted,
        AmiError::PoolShutdown | AmiError::InvalidConfig { .. } => ErrorKind::InvalidConfiguration,
        _ => ErrorKind::ConnectionFailure,
    }
}

/// One attempt's failure, tagged with the phase it happened in.
enum AttemptError {
    /// Acquiring a connection failed; the action was never sent.
    Acquire(AmiError),
    /// The action was carried (or carried partway) on a live connection.
    Send(AmiError),
}

impl AttemptError {
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Acquire(e) => classify_acquire(e),
            AttemptError::Send(e) => classify(e),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Acquire(e) => write!(f, "acquire failed: {}", e),
            AttemptError::Send(e) => e.fmt(f),
        }
    }
}

/// Server rejections carry free text; pick the taxonomy bucket from it.
fn classify_server_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("not authorized") {
        ErrorKind::PermissionDenied
    } else if lower.contains("invalid") || lower.contains("missing") || lower.contains("no such") {
        ErrorKind::InvalidParameter
    } else {
        ErrorKind::ActionExecutionFailure
    }
}

/// Executes actions through the pool with timeout, retry, and error
/// sanitization.
///
/// Transient failures (timeouts, I/O errors, mid-exchange disconnects)
/// are retried on a fresh connection with exponential backoff; explicit
/// server rejections are surfaced immediately.
pub struct ActionExecutor {
    pool: ConnectionPool,
    config: ManagerConfig,
    sanitizer: ErrorSanitizer,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("pool", &self.pool)
            .finish()
    }
}

impl ActionExecutor {
    /// Executor with the default tracing-backed audit sink.
    pub fn new(pool: ConnectionPool, config: ManagerConfig) -> Self {
        Self::with_audit_sink(pool, config, Arc::new(TracingAuditSink))
    }

    /// Executor with a custom audit sink.
    pub fn with_audit_sink(
        pool: ConnectionPool,
        config: ManagerConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let sanitizer = ErrorSanitizer::new(config.mask_port_fully);
        Self {
            pool,
            config,
            sanitizer,
            audit,
        }
    }

    /// The pool this executor draws from.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute one action to completion or terminal failure.
    pub async fn execute(&self, action: &Action) -> Result<ActionResponse, ExecutionError> {
        if let Err(detail) = validate_parameters(action) {
            return Err(self.fail(ErrorKind::InvalidParameter, action, 0, detail));
        }

        let retry = &self.config.retry;
        let mut last: Option<AttemptError> = None;

        for attempt in 1..=retry.max_attempts {
            if attempt > 1 {
                let backoff = retry.backoff_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.attempt(action).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let kind = e.kind();
                    if !kind.is_transient() {
                        return Err(self.fail(kind, action, attempt, e.to_string()));
                    }
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        error = %e,
                        "Transient failure, will retry on a fresh connection"
                    );
                    last = Some(e);
                }
            }
        }

        let e = last.unwrap_or(AttemptError::Acquire(AmiError::PoolExhausted));
        let kind = e.kind();
        Err(self.fail(kind, action, retry.max_attempts, e.to_string()))
    }

    /// One attempt: acquire, send, release. A send failure quarantines
    /// the connection so the next attempt gets a fresh one.
    async fn attempt(&self, action: &Action) -> Result<ActionResponse, AttemptError> {
        let mut guard = self.pool.acquire().await.map_err(AttemptError::Acquire)?;
        let response = guard
            .send_action(action)
            .await
            .map_err(AttemptError::Send)?;
        response.into_result().map_err(AttemptError::Send)
    }

    /// Build the sanitized error, routing full context to the audit sink.
    fn fail(
        &self,
        kind: ErrorKind,
        action: &Action,
        attempts: u32,
        detail: String,
    ) -> ExecutionError {
        let raw_context: Context = vec![
            ("action".to_string(), ContextValue::from(action.name())),
            ("host".to_string(), ContextValue::from(self.config.host.as_str())),
            ("port".to_string(), ContextValue::from(self.config.port)),
            (
                "username".to_string(),
                ContextValue::from(self.config.username.as_str()),
            ),
            ("attempts".to_string(), ContextValue::Number(attempts as i64)),
            ("detail".to_string(), ContextValue::from(detail)),
        ];
        let record = self.sanitizer.build_record(kind, raw_context);
        self.audit.record_error(&record);
        ExecutionError {
            kind: record.kind,
            reference: record.reference,
        }
    }

    /// Shut down the underlying pool.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}
