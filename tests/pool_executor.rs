//! Integration tests against an in-process mock AMI server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;

use asterisk_ami_tokio::{
    Action, ActionExecutor, AmiError, AuditSink, ConnectionPool, DomainEvent, ErrorKind,
    ErrorRecord, EventCategory, EventListener, EventProcessor, ManagerConfig, ManagerConnection,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Accept logins, answer every action with Success.
    Ok,
    /// Reject the login handshake.
    RejectAuth,
    /// Accept logins but never answer non-login actions.
    SilentActions,
    /// Answer actions with a wrong ActionID, desyncing the client.
    WrongActionId,
    /// Answer actions with Success after a 200ms delay.
    SlowActions,
}

/// Scriptable mock manager server.
struct MockAmiServer {
    addr: SocketAddr,
    /// Non-login, non-logoff actions received across all connections.
    actions: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    events: broadcast::Sender<String>,
}

impl MockAmiServer {
    async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let actions = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let (events, _) = broadcast::channel(16384);

        let accept_actions = actions.clone();
        let accept_connections = connections.clone();
        let accept_events = events.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_conn(
                    stream,
                    mode,
                    accept_actions.clone(),
                    accept_events.subscribe(),
                ));
            }
        });

        Self {
            addr,
            actions,
            connections,
            events,
        }
    }

    /// Config pointed at this server with test-sized timeouts. The long
    /// health interval keeps maintenance probes out of the counters.
    fn config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new("127.0.0.1", "admin", "secret123");
        config.port = self.addr.port();
        config.connect_timeout = Duration::from_millis(1000);
        config.action_timeout = Duration::from_millis(300);
        config.pool.min_size = 1;
        config.pool.max_size = 2;
        config.pool.acquire_timeout = Duration::from_millis(500);
        config.pool.health_check_interval = Duration::from_secs(60);
        config.retry.max_attempts = 3;
        config.retry.initial_backoff = Duration::from_millis(20);
        config.retry.max_backoff = Duration::from_millis(100);
        config
    }

    /// Broadcast a raw frame to every connected client.
    fn emit(&self, frame: &str) {
        let _ = self.events.send(frame.to_string());
    }
}

async fn handle_conn(
    stream: TcpStream,
    mode: Mode,
    actions: Arc<AtomicUsize>,
    mut events: broadcast::Receiver<String>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    if write
        .write_all(b"Asterisk Call Manager/9.0.0\r\n")
        .await
        .is_err()
    {
        return;
    }

    // All writes funnel through one channel so event frames never
    // interleave mid-response.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    let event_out = out_tx.clone();
    tokio::spawn(async move {
        while let Ok(frame) = events.recv().await {
            if event_out.send(frame).is_err() {
                break;
            }
        }
    });

    loop {
        let Some(block) = read_block(&mut reader).await else {
            return;
        };
        let get = |key: &str| {
            block
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        let action = get("Action").unwrap_or_default();
        let action_id = get("ActionID").unwrap_or_default();

        if action.eq_ignore_ascii_case("Login") {
            if mode == Mode::RejectAuth {
                let _ = out_tx.send(format!(
                    "Response: Error\r\nActionID: {}\r\nMessage: Authentication failed\r\n\r\n",
                    action_id
                ));
                return;
            }
            let _ = out_tx.send(format!(
                "Response: Success\r\nActionID: {}\r\nMessage: Authentication accepted\r\n\r\n",
                action_id
            ));
            continue;
        }
        if action.eq_ignore_ascii_case("Logoff") {
            let _ = out_tx.send(format!(
                "Response: Goodbye\r\nActionID: {}\r\n\r\n",
                action_id
            ));
            return;
        }

        actions.fetch_add(1, Ordering::SeqCst);
        if mode == Mode::SilentActions {
            continue;
        }
        if mode == Mode::SlowActions {
            sleep(Duration::from_millis(200)).await;
        }
        let reply_id = if mode == Mode::WrongActionId {
            "bogus".to_string()
        } else {
            action_id
        };
        let _ = out_tx.send(format!(
            "Response: Success\r\nActionID: {}\r\nMessage: Ok\r\n\r\n",
            reply_id
        ));
    }
}

async fn read_block(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<(String, String)>> {
    let mut fields = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if fields.is_empty() {
                continue;
            }
            return Some(fields);
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_for(mut predicate: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[derive(Default)]
struct CapturingSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl AuditSink for CapturingSink {
    fn record_error(&self, record: &ErrorRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
    fn record_listener_failure(&self, _category: &str, _index: usize, _detail: &str) {}
}

struct CollectingListener {
    events: Mutex<Vec<DomainEvent>>,
    count: AtomicUsize,
}

impl CollectingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        })
    }
}

impl EventListener for CollectingListener {
    fn on_event(
        &self,
        event: &DomainEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.lock().unwrap();
        if events.len() < 64 {
            events.push(event.clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_execute_action_end_to_end() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let config = server.config();
    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let executor = ActionExecutor::new(pool, config);

    let response = executor
        .execute(&Action::hangup("PJSIP/1000-00000001"))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(server.actions.load(Ordering::SeqCst), 1);

    executor.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_pool_never_exceeds_max_size() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 1;
    config.pool.max_size = 2;
    config.pool.acquire_timeout = Duration::from_millis(200);

    let pool = ConnectionPool::new(config).await.unwrap();
    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();

    // Both slots held: the third acquire must time out, not create.
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, AmiError::PoolExhausted));
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.in_use, 2);
    assert_eq!(stats.acquire_timeouts, 1);

    drop(g1);
    drop(g2);
    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_waiters_served_fifo_on_release() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 1;
    config.pool.max_size = 2;
    config.pool.acquire_timeout = Duration::from_secs(3);

    let pool = ConnectionPool::new(config).await.unwrap();
    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    let (ready_a, a_registered) = oneshot::channel();
    let pool_a = pool.clone();
    let order_a = order.clone();
    let waiter_a = tokio::spawn(async move {
        ready_a.send(()).unwrap();
        let guard = pool_a.acquire().await.unwrap();
        order_a.lock().unwrap().push("a");
        guard
    });
    a_registered.await.unwrap();
    sleep(Duration::from_millis(50)).await; // a joins the queue first

    let pool_b = pool.clone();
    let order_b = order.clone();
    let waiter_b = tokio::spawn(async move {
        let guard = pool_b.acquire().await.unwrap();
        order_b.lock().unwrap().push("b");
        guard
    });
    sleep(Duration::from_millis(50)).await;

    drop(g1);
    let ga = waiter_a.await.unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), ["a"]);

    drop(g2);
    let gb = waiter_b.await.unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), ["a", "b"]);

    // No new connections were created for the handoffs.
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    drop(ga);
    drop(gb);
    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_errored_connection_not_reused() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 0;
    config.pool.max_size = 2;

    let pool = ConnectionPool::new(config).await.unwrap();

    let mut g1 = pool.acquire().await.unwrap();
    let id1 = g1.connection_stats().unwrap().id;
    g1.mark_failed();
    drop(g1);

    assert!(
        wait_for(|| pool.stats().recycled_total >= 1, Duration::from_secs(2)).await,
        "errored connection was not recycled"
    );

    let g2 = pool.acquire().await.unwrap();
    let id2 = g2.connection_stats().unwrap().id;
    assert_ne!(id1, id2);

    drop(g2);
    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_desynced_connection_recycled_not_reused() {
    init_tracing();
    let server = MockAmiServer::start(Mode::WrongActionId).await;
    let mut config = server.config();
    config.pool.min_size = 0;
    config.pool.max_size = 2;

    let pool = ConnectionPool::new(config).await.unwrap();

    let mut g1 = pool.acquire().await.unwrap();
    let id1 = g1.connection_stats().unwrap().id;
    let err = g1.send_action(&Action::ping()).await.unwrap_err();
    assert!(matches!(err, AmiError::ProtocolError { .. }));
    drop(g1);

    // The mismatched reply must quarantine the connection.
    assert!(
        wait_for(|| pool.stats().recycled_total >= 1, Duration::from_secs(2)).await,
        "desynced connection was not recycled"
    );

    let g2 = pool.acquire().await.unwrap();
    assert_ne!(id1, g2.connection_stats().unwrap().id);

    drop(g2);
    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_retry_makes_exactly_max_attempts() {
    init_tracing();
    let server = MockAmiServer::start(Mode::SilentActions).await;
    let mut config = server.config();
    config.action_timeout = Duration::from_millis(150);
    config.retry.max_attempts = 3;
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(40);
    config.pool.min_size = 0;
    config.pool.max_size = 2;

    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let executor = ActionExecutor::new(pool, config);

    let err = executor
        .execute(&Action::hangup("PJSIP/1000-00000001"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActionTimeout);
    assert_eq!(server.actions.load(Ordering::SeqCst), 3);

    executor.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_refused_connect_reports_connection_failure() {
    init_tracing();
    // Grab a free port, then close the listener so connects are refused.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = ManagerConfig::new("127.0.0.1", "admin", "secret123");
    config.port = closed_port;
    config.connect_timeout = Duration::from_millis(500);
    config.pool.min_size = 0;
    config.pool.health_check_interval = Duration::from_secs(60);
    config.retry.max_attempts = 2;
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(20);

    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let executor = ActionExecutor::new(pool, config);

    // The caller never got a connection: not an action timeout.
    let err = executor
        .execute(&Action::hangup("PJSIP/1000-00000001"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionFailure);

    executor.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_invalid_parameters_fail_before_any_io() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let config = server.config();
    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let executor = ActionExecutor::new(pool, config);

    let err = executor
        .execute(&Action::builder("Originate").build())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert_eq!(server.actions.load(Ordering::SeqCst), 0);

    executor.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_auth_rejection_surfaces_as_authentication_failure() {
    init_tracing();
    let server = MockAmiServer::start(Mode::RejectAuth).await;
    let config = server.config();

    let err = ManagerConnection::connect(&config).await.unwrap_err();
    assert!(matches!(err, AmiError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn test_sanitized_error_masks_identifying_fields() {
    init_tracing();
    // Unreachable endpoint; only the zero-I/O validation path is hit.
    let mut config = ManagerConfig::new("192.168.1.100", "admin", "secret123");
    config.connect_timeout = Duration::from_millis(50);
    config.pool.min_size = 0;
    config.pool.health_check_interval = Duration::from_secs(60);

    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let sink = Arc::new(CapturingSink::default());
    let executor = ActionExecutor::with_audit_sink(pool, config, sink.clone());

    let err = executor
        .execute(&Action::builder("Originate").build())
        .await
        .unwrap_err();

    let rendered = err.to_string();
    assert!(!rendered.contains("admin"));
    assert!(!rendered.contains("192.168.1.100"));
    assert!(rendered.contains(err.code()));
    assert!(rendered.contains(err.reference.as_str()));

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    let sanitized = |key: &str| {
        record
            .sanitized_context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| format!("{:?}", v))
            .unwrap()
    };
    assert!(sanitized("username").contains("a***n"));
    assert!(sanitized("host").contains("1***********0"));
    // The raw context keeps the full values for the audit trail.
    assert!(format!("{:?}", record.raw_context).contains("192.168.1.100"));

    executor.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_event_pipeline_delivers_typed_events() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 1;
    config.pool.max_size = 1;

    let processor = EventProcessor::new();
    let hangups = CollectingListener::new();
    processor.register(EventCategory::Hangup, hangups.clone());

    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    processor.attach(stream_rx);
    let pool = ConnectionPool::with_event_sink(config, Some(stream_tx))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await; // pump attaches

    server.emit(
        "Event: Hangup\r\nChannel: PJSIP/1000-00000001\r\nCause: 17\r\nUniqueid: 16000.1\r\n\r\n",
    );

    assert!(
        wait_for(
            || hangups.count.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        )
        .await,
        "hangup event never arrived"
    );

    let events = hangups.events.lock().unwrap();
    match &events[0] {
        DomainEvent::Hangup(h) => {
            assert_eq!(h.channel.as_deref(), Some("PJSIP/1000-00000001"));
            assert!(h.was_busy());
            assert!(!h.was_normal());
        }
        other => panic!("expected Hangup, got {:?}", other),
    }
    drop(events);

    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_sustained_event_load_is_fully_delivered() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 1;
    config.pool.max_size = 1;

    let processor = EventProcessor::new();
    let all = CollectingListener::new();
    processor.register_any(all.clone());

    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    processor.attach(stream_rx);
    let pool = ConnectionPool::with_event_sink(config, Some(stream_tx))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    const N: usize = 500;
    for i in 0..N {
        server.emit(&format!(
            "Event: Newchannel\r\nChannel: PJSIP/10{:03}-0\r\nUniqueid: {}\r\n\r\n",
            i, i
        ));
    }

    assert!(
        wait_for(
            || all.count.load(Ordering::SeqCst) == N,
            Duration::from_secs(5)
        )
        .await,
        "delivered {} of {} events",
        all.count.load(Ordering::SeqCst),
        N
    );

    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_maintenance_probes_every_idle_connection() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 2;
    config.pool.max_size = 2;
    config.pool.health_check_interval = Duration::from_millis(150);

    let pool = ConnectionPool::new(config).await.unwrap();

    // Both idle connections get a Ping on the first sweep.
    assert!(
        wait_for(
            || server.actions.load(Ordering::SeqCst) >= 2,
            Duration::from_secs(2)
        )
        .await,
        "idle connections were not probed"
    );
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.recycled_total, 0);

    pool.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_concurrent_executes_at_capacity_block_then_succeed() {
    init_tracing();
    let server = MockAmiServer::start(Mode::SlowActions).await;
    let mut config = server.config();
    config.pool.min_size = 1;
    config.pool.max_size = 2;
    config.action_timeout = Duration::from_millis(1000);
    config.pool.acquire_timeout = Duration::from_secs(2);

    let pool = ConnectionPool::new(config.clone()).await.unwrap();
    let executor = Arc::new(ActionExecutor::new(pool, config));

    let mut handles = Vec::new();
    for i in 0..3 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .execute(&Action::hangup(&format!("PJSIP/100{}-0", i)))
                .await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(response.is_success());
    }

    // The third call waited for a release instead of a third connection.
    assert_eq!(server.actions.load(Ordering::SeqCst), 3);
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    executor.shutdown(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_shutdown_rejects_further_acquires() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let pool = ConnectionPool::new(server.config()).await.unwrap();

    pool.shutdown(Duration::from_millis(500)).await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, AmiError::PoolShutdown));
    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    // The warm-up connection was closed at shutdown, not recycled.
    assert_eq!(stats.destroyed_total, 1);
    assert_eq!(stats.recycled_total, 0);
}

#[tokio::test]
async fn test_pool_warm_up_reaches_min_size() {
    init_tracing();
    let server = MockAmiServer::start(Mode::Ok).await;
    let mut config = server.config();
    config.pool.min_size = 2;
    config.pool.max_size = 4;

    let pool = ConnectionPool::new(config).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.total, 2);
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    pool.shutdown(Duration::from_millis(500)).await;
}
