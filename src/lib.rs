//! Resilient, pooled [Asterisk Manager Interface](https://docs.asterisk.org/Configuration/Interfaces/Asterisk-Manager-Interface-AMI/)
//! (AMI) client for tokio.
//!
//! The crate maintains a bounded pool of authenticated manager
//! connections, executes actions with per-attempt timeouts and
//! exponential-backoff retry of transient failures, and converts the
//! unsolicited event stream into typed domain events fanned out to
//! registered listeners. Failures surface to callers with generic
//! messages and stable codes; the unredacted detail goes to an audit
//! sink under an opaque correlation reference.
//!
//! # Executing actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, ActionExecutor, ConnectionPool, ManagerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ManagerConfig::new("pbx.example.com", "admin", "secret");
//! let pool = ConnectionPool::new(config.clone()).await?;
//! let executor = ActionExecutor::new(pool, config);
//!
//! let response = executor
//!     .execute(&Action::originate("PJSIP/1000", "2000", "default"))
//!     .await?;
//! println!("originate accepted: {}", response.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! # Consuming events
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use asterisk_ami_tokio::{
//!     ConnectionPool, DomainEvent, EventCategory, EventProcessor, ManagerConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ManagerConfig::new("pbx.example.com", "admin", "secret");
//! let processor = EventProcessor::new();
//! processor.register(
//!     EventCategory::Hangup,
//!     Arc::new(|event: &DomainEvent| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         if let DomainEvent::Hangup(hangup) = event {
//!             println!("hangup: {:?} busy={}", hangup.channel, hangup.was_busy());
//!         }
//!         Ok(())
//!     }),
//! );
//!
//! let (stream_tx, stream_rx) = mpsc::unbounded_channel();
//! processor.attach(stream_rx);
//! let _pool = ConnectionPool::with_event_sink(config, Some(stream_tx)).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod executor;
pub mod pool;
pub mod processor;
pub mod protocol;
pub mod sanitize;

pub use action::{Action, ActionBuilder, ActionResponse, Fields, ResponseStatus};
pub use config::{BalanceStrategy, ManagerConfig, PoolOptions, RetryOptions};
pub use connection::{
    AmiEventStream, ConnectOptions, ConnectionStatus, DisconnectReason, ManagerConnection,
};
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult};
pub use event::{
    hangup_cause_text, BridgeEvent, DialBeginEvent, DialEndEvent, DomainEvent, EventCategory,
    GenericEvent, HangupEvent, MemberAvailability, NewChannelEvent, QueueMemberEvent, RawEvent,
};
pub use executor::{ActionExecutor, ExecutionError};
pub use pool::{
    ConnectionPool, ConnectionState, ConnectionStats, PoolGuard, PoolStats, PooledConnection,
};
pub use processor::{EventListener, EventProcessor};
pub use sanitize::{
    AuditSink, Context, ContextValue, CorrelationRef, ErrorKind, ErrorRecord, ErrorSanitizer,
    TracingAuditSink,
};
