//! Event dispatch: typed conversion and isolated listener fan-out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    connection::AmiEventStream,
    error::AmiError,
    event::{DomainEvent, EventCategory, RawEvent},
    sanitize::{AuditSink, TracingAuditSink},
};

/// Receives typed events. Implementations must not block; heavy work
/// belongs on a task fed from the listener.
pub trait EventListener: Send + Sync {
    /// Handle one event. An `Err` is recorded and does not affect other
    /// listeners.
    fn on_event(&self, event: &DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> EventListener for F
where
    F: Fn(&DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    fn on_event(&self, event: &DomainEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(event)
    }
}

#[derive(Default)]
struct Registry {
    by_category: HashMap<EventCategory, Vec<Arc<dyn EventListener>>>,
    any: Vec<Arc<dyn EventListener>>,
}

/// Classifies raw events and fans them out to registered listeners.
///
/// Each listener invocation is individually isolated: a panicking or
/// erroring listener is reported to the audit sink and the remaining
/// listeners still run. Per connection, events are dispatched in arrival
/// order by a pump task.
#[derive(Clone)]
pub struct EventProcessor {
    registry: Arc<RwLock<Registry>>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("EventProcessor")
            .field("categories", &registry.by_category.len())
            .field("any_listeners", &registry.any.len())
            .finish()
    }
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    /// Processor with the default tracing-backed audit sink.
    pub fn new() -> Self {
        Self::with_audit_sink(Arc::new(TracingAuditSink))
    }

    /// Processor with a custom audit sink.
    pub fn with_audit_sink(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            audit,
        }
    }

    /// Register a listener for one event category.
    pub fn register(&self, category: EventCategory, listener: Arc<dyn EventListener>) {
        self.registry
            .write()
            .by_category
            .entry(category)
            .or_default()
            .push(listener);
    }

    /// Register a listener receiving every event.
    pub fn register_any(&self, listener: Arc<dyn EventListener>) {
        self.registry.write().any.push(listener);
    }

    /// Convert and dispatch one raw event.
    pub fn process(&self, raw: RawEvent) {
        let event = DomainEvent::from_raw(raw);
        let category = event.category();

        let registry = self.registry.read();
        let category_listeners = registry
            .by_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (index, listener) in category_listeners
            .iter()
            .chain(registry.any.iter())
            .enumerate()
        {
            self.invoke(listener, index, category, &event);
        }
    }

    /// Run one listener, containing both `Err` returns and panics.
    fn invoke(
        &self,
        listener: &Arc<dyn EventListener>,
        index: usize,
        category: EventCategory,
        event: &DomainEvent,
    ) {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%category, index, error = %e, "Event listener returned error");
                self.audit
                    .record_listener_failure(&category.to_string(), index, &e.to_string());
            }
            Err(_) => {
                warn!(%category, index, "Event listener panicked");
                self.audit
                    .record_listener_failure(&category.to_string(), index, "listener panicked");
            }
        }
    }

    /// Spawn a pump draining one connection's event stream into the
    /// processor. Ends when the connection's reader task exits.
    pub fn spawn_pump(&self, mut stream: AmiEventStream) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.recv().await {
                match item {
                    Ok(raw) => processor.process(raw),
                    Err(AmiError::QueueFull) => {
                        warn!("Event queue overflowed, some events were dropped");
                    }
                    Err(e) => {
                        warn!("Event stream error: {}", e);
                    }
                }
            }
            debug!("Event pump finished");
        })
    }

    /// Consume event streams from a pool, spawning a pump for each new
    /// connection. Pair with
    /// [`ConnectionPool::with_event_sink`](crate::ConnectionPool::with_event_sink).
    pub fn attach(&self, mut streams: mpsc::UnboundedReceiver<AmiEventStream>) {
        let processor = self.clone();
        tokio::spawn(async move {
            while let Some(stream) = streams.recv().await {
                processor.spawn_pump(stream);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Fields;
    use crate::sanitize::ErrorRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn raw(name: &str, pairs: &[(&str, &str)]) -> RawEvent {
        let mut fields = Fields::new();
        fields.push("Event", name);
        for (k, v) in pairs {
            fields.push(*k, *v);
        }
        RawEvent::from_fields(fields)
    }

    #[derive(Default)]
    struct CapturingSink {
        listener_failures: Mutex<Vec<(String, usize, String)>>,
    }

    impl AuditSink for CapturingSink {
        fn record_error(&self, _record: &ErrorRecord) {}
        fn record_listener_failure(&self, category: &str, index: usize, detail: &str) {
            self.listener_failures.lock().unwrap().push((
                category.to_string(),
                index,
                detail.to_string(),
            ));
        }
    }

    struct CountingListener(AtomicUsize);

    impl EventListener for CountingListener {
        fn on_event(
            &self,
            _event: &DomainEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct FailingListener;

    impl EventListener for FailingListener {
        fn on_event(
            &self,
            _event: &DomainEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("listener broke".into())
        }
    }

    struct PanickingListener;

    impl EventListener for PanickingListener {
        fn on_event(
            &self,
            _event: &DomainEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            panic!("listener blew up");
        }
    }

    #[test]
    fn test_category_routing() {
        let processor = EventProcessor::new();
        let hangups = Arc::new(CountingListener(AtomicUsize::new(0)));
        let dials = Arc::new(CountingListener(AtomicUsize::new(0)));
        processor.register(EventCategory::Hangup, hangups.clone());
        processor.register(EventCategory::DialBegin, dials.clone());

        processor.process(raw("Hangup", &[("Cause", "16")]));
        processor.process(raw("Hangup", &[("Cause", "17")]));
        processor.process(raw("DialBegin", &[]));

        assert_eq!(hangups.0.load(Ordering::Relaxed), 2);
        assert_eq!(dials.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_any_listener_sees_everything() {
        let processor = EventProcessor::new();
        let all = Arc::new(CountingListener(AtomicUsize::new(0)));
        processor.register_any(all.clone());

        processor.process(raw("Hangup", &[]));
        processor.process(raw("SomethingUnmapped", &[]));

        assert_eq!(all.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let sink = Arc::new(CapturingSink::default());
        let processor = EventProcessor::with_audit_sink(sink.clone());
        let survivor = Arc::new(CountingListener(AtomicUsize::new(0)));
        processor.register(EventCategory::Hangup, Arc::new(FailingListener));
        processor.register(EventCategory::Hangup, survivor.clone());

        processor.process(raw("Hangup", &[("Cause", "16")]));

        assert_eq!(survivor.0.load(Ordering::Relaxed), 1);
        let failures = sink.listener_failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "Hangup");
        assert!(failures[0].2.contains("listener broke"));
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let sink = Arc::new(CapturingSink::default());
        let processor = EventProcessor::with_audit_sink(sink.clone());
        let survivor = Arc::new(CountingListener(AtomicUsize::new(0)));
        processor.register(EventCategory::Hangup, Arc::new(PanickingListener));
        processor.register(EventCategory::Hangup, survivor.clone());

        processor.process(raw("Hangup", &[("Cause", "16")]));

        assert_eq!(survivor.0.load(Ordering::Relaxed), 1);
        assert_eq!(sink.listener_failures.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_closure_listener() {
        let processor = EventProcessor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        processor.register_any(Arc::new(
            move |_event: &DomainEvent| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                count2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        ));
        processor.process(raw("Hangup", &[]));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
