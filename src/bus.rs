// =============================================================================
// Event Bus — three bounded queues with distinct overflow and drain policies
// =============================================================================
//
// Queues and their semantics:
//
//   data   (cap 1000)  market candles; on overflow the incoming event is
//                      dropped, a counter bumped, and a warning logged.
//   signal (cap 100)   strategy signals; publishers block up to 5 s for a
//                      slot, then the event is dropped and audited.
//   order  (cap 50)    fills and user-stream updates; publishers block for
//                      as long as it takes.  Never dropped.
//
// Each queue is drained by its own task.  Within a queue, handlers observe
// events in publish order and run to completion one at a time; across queues
// handlers run concurrently.  A failing (or panicking) handler is logged and
// audited, never killing the drain loop.
// =============================================================================

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::market_data::Candle;
use crate::types::{now_ms, OrderUpdate, PositionUpdate, Signal};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Discriminates events for handler subscription and queue routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    CandleUpdate,
    CandleClosed,
    SignalGenerated,
    OrderFilled,
    OrderPartiallyFilled,
    OrderCancelled,
    PositionUpdate,
}

impl EventTag {
    /// The queue this event tag travels on.
    pub fn queue(self) -> QueueName {
        match self {
            Self::CandleUpdate | Self::CandleClosed => QueueName::Data,
            Self::SignalGenerated => QueueName::Signal,
            Self::OrderFilled
            | Self::OrderPartiallyFilled
            | Self::OrderCancelled
            | Self::PositionUpdate => QueueName::Order,
        }
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CandleUpdate => "candle_update",
            Self::CandleClosed => "candle_closed",
            Self::SignalGenerated => "signal_generated",
            Self::OrderFilled => "order_filled",
            Self::OrderPartiallyFilled => "order_partially_filled",
            Self::OrderCancelled => "order_cancelled",
            Self::PositionUpdate => "position_update",
        };
        f.write_str(s)
    }
}

/// The three named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Data,
    Signal,
    Order,
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Signal => write!(f, "signal"),
            Self::Order => write!(f, "order"),
        }
    }
}

/// Payload variants carried by [`Event`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    Candle(Candle),
    Signal(Signal),
    Order(OrderUpdate),
    Position(PositionUpdate),
}

/// An event travelling on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub tag: EventTag,
    pub payload: EventPayload,
    /// Epoch milliseconds at enqueue time.
    pub enqueued_ms: i64,
}

impl Event {
    pub fn new(tag: EventTag, payload: EventPayload) -> Self {
        Self {
            tag,
            payload,
            enqueued_ms: now_ms(),
        }
    }

    /// Candle convenience constructor; picks the tag from `is_closed`.
    pub fn from_candle(candle: Candle) -> Self {
        let tag = if candle.is_closed {
            EventTag::CandleClosed
        } else {
            EventTag::CandleUpdate
        };
        Self::new(tag, EventPayload::Candle(candle))
    }
}

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued,
    Dropped,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// An async event handler. Registered per tag via [`EventBus::subscribe`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and audit lines.
    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

type HandlerMap = HashMap<EventTag, Vec<Arc<dyn EventHandler>>>;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// How long a signal publisher waits for a slot before dropping.
const SIGNAL_ENQUEUE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const DATA_CAPACITY: usize = 1000;
const SIGNAL_CAPACITY: usize = 100;
const ORDER_CAPACITY: usize = 50;

struct QueueChannel {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    capacity: usize,
}

impl QueueChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
        }
    }

    /// True when no events are waiting in the channel.
    fn is_empty(&self) -> bool {
        self.tx.capacity() == self.capacity
    }
}

/// The engine-wide event bus.
pub struct EventBus {
    data: QueueChannel,
    signal: QueueChannel,
    order: QueueChannel,
    handlers: Arc<RwLock<HandlerMap>>,
    accepting: Arc<AtomicBool>,
    data_dropped: AtomicU64,
    signal_dropped: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    audit: Arc<AuditLogger>,
}

impl EventBus {
    /// Bus with the production queue capacities.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self::with_capacities(audit, DATA_CAPACITY, SIGNAL_CAPACITY, ORDER_CAPACITY)
    }

    /// Bus with explicit capacities (tests shrink them to force overflow).
    pub fn with_capacities(
        audit: Arc<AuditLogger>,
        data_cap: usize,
        signal_cap: usize,
        order_cap: usize,
    ) -> Self {
        Self {
            data: QueueChannel::new(data_cap),
            signal: QueueChannel::new(signal_cap),
            order: QueueChannel::new(order_cap),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            data_dropped: AtomicU64::new(0),
            signal_dropped: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            audit,
        }
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------

    /// Register a handler for `tag`. Handlers for the same tag run in
    /// registration order.
    pub fn subscribe(&self, tag: EventTag, handler: Arc<dyn EventHandler>) {
        debug!(tag = %tag, handler = handler.name(), "handler subscribed");
        self.handlers.write().entry(tag).or_default().push(handler);
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Non-blocking publish, safe to call from any thread (no runtime
    /// context required).  Applies the data-queue overflow policy: on a full
    /// queue the incoming event is dropped and counted.
    ///
    /// This is the market-stream callback path; it must return in
    /// microseconds and never touch I/O.
    pub fn try_publish(&self, event: Event) -> PublishOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            return PublishOutcome::Dropped;
        }

        let channel = self.channel_for(event.tag.queue());
        match channel.tx.try_send(event) {
            Ok(()) => PublishOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                let dropped = self.data_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    tag = %ev.tag,
                    queue = %ev.tag.queue(),
                    total_dropped = dropped,
                    "queue full — event dropped"
                );
                PublishOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PublishOutcome::Dropped,
        }
    }

    /// Publish with the per-queue overflow semantics:
    /// data = non-blocking drop-newest, signal = bounded wait then drop,
    /// order = wait for a slot indefinitely.
    pub async fn publish(&self, event: Event) -> PublishOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(tag = %event.tag, "publish rejected — bus shutting down");
            return PublishOutcome::Dropped;
        }

        match event.tag.queue() {
            QueueName::Data => self.try_publish(event),
            QueueName::Signal => {
                let tag = event.tag;
                match tokio::time::timeout(SIGNAL_ENQUEUE_TIMEOUT, self.signal.tx.send(event))
                    .await
                {
                    Ok(Ok(())) => PublishOutcome::Enqueued,
                    Ok(Err(_)) => PublishOutcome::Dropped,
                    Err(_elapsed) => {
                        let dropped = self.signal_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(tag = %tag, total_dropped = dropped, "signal queue blocked for 5s — event dropped");
                        self.audit.log_global(
                            AuditKind::EventDropped,
                            json!({ "queue": "signal", "tag": tag.to_string() }),
                        );
                        PublishOutcome::Dropped
                    }
                }
            }
            QueueName::Order => match self.order.tx.send(event).await {
                Ok(()) => PublishOutcome::Enqueued,
                Err(_) => PublishOutcome::Dropped,
            },
        }
    }

    /// Total events dropped from the data queue since startup.
    pub fn data_dropped(&self) -> u64 {
        self.data_dropped.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Drain tasks
    // -------------------------------------------------------------------------

    /// Spawn the three drain tasks. Call once after all subscriptions are in
    /// place; events published before `start` wait in their queues.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("event bus already started");
            return;
        }

        for (name, channel) in [
            (QueueName::Data, &self.data),
            (QueueName::Signal, &self.signal),
            (QueueName::Order, &self.order),
        ] {
            let rx = channel
                .rx
                .lock()
                .take()
                .expect("queue receiver taken twice");
            tasks.push(tokio::spawn(drain_loop(
                name,
                rx,
                self.handlers.clone(),
                self.audit.clone(),
            )));
        }

        info!("event bus started (3 drain tasks)");
    }

    /// Stop accepting publishes, wait up to `grace` for the queues to empty,
    /// then cancel the drain tasks.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.accepting.store(false, Ordering::Release);
        info!(grace_secs = grace.as_secs_f64(), "event bus draining");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let empty =
                self.data.is_empty() && self.signal.is_empty() && self.order.is_empty();
            if empty {
                // One more tick so the drain tasks finish the event they may
                // be processing right now.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("event bus drain deadline exceeded — cancelling drain tasks");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("event bus stopped");
    }

    fn channel_for(&self, queue: QueueName) -> &QueueChannel {
        match queue {
            QueueName::Data => &self.data,
            QueueName::Signal => &self.signal,
            QueueName::Order => &self.order,
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("data_dropped", &self.data_dropped.load(Ordering::Relaxed))
            .field(
                "signal_dropped",
                &self.signal_dropped.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Drain one queue forever: take, look up handlers, run each to completion.
/// Handler failures (errors and panics) are contained here.
async fn drain_loop(
    queue: QueueName,
    mut rx: mpsc::Receiver<Event>,
    handlers: Arc<RwLock<HandlerMap>>,
    audit: Arc<AuditLogger>,
) {
    debug!(queue = %queue, "drain task started");

    while let Some(event) = rx.recv().await {
        // Snapshot the handler list so registration never blocks dispatch.
        let subscribed: Vec<Arc<dyn EventHandler>> = handlers
            .read()
            .get(&event.tag)
            .map(|v| v.to_vec())
            .unwrap_or_default();

        for handler in subscribed {
            let outcome = AssertUnwindSafe(handler.handle(event.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        queue = %queue,
                        tag = %event.tag,
                        handler = handler.name(),
                        error = %e,
                        "event handler failed"
                    );
                    audit.log_global(
                        AuditKind::HandlerError,
                        json!({
                            "handler": handler.name(),
                            "tag": event.tag.to_string(),
                            "error": e.to_string(),
                        }),
                    );
                }
                Err(_panic) => {
                    error!(
                        queue = %queue,
                        tag = %event.tag,
                        handler = handler.name(),
                        "event handler panicked"
                    );
                    audit.log_global(
                        AuditKind::HandlerError,
                        json!({
                            "handler": handler.name(),
                            "tag": event.tag.to_string(),
                            "error": "panic",
                        }),
                    );
                }
            }
        }
    }

    debug!(queue = %queue, "drain task ended");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;

    fn test_audit() -> Arc<AuditLogger> {
        let dir = std::env::temp_dir().join(format!("vela-bus-{}", uuid::Uuid::new_v4()));
        Arc::new(AuditLogger::new(dir).unwrap())
    }

    fn candle(symbol: &str, close_time: i64, closed: bool) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: "5m".into(),
            open_time: close_time - 300_000,
            close_time,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            is_closed: closed,
        }
    }

    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
    }

    impl Recorder {
        fn new(fail_on: Option<i64>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            if let EventPayload::Candle(c) = &event.payload {
                if self.fail_on == Some(c.close_time) {
                    anyhow::bail!("intentional failure");
                }
                self.seen.lock().push(c.close_time);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_observe_publish_order() {
        let bus = EventBus::new(test_audit());
        let recorder = Recorder::new(None);
        bus.subscribe(EventTag::CandleClosed, recorder.clone());
        bus.start();

        for t in 1..=20 {
            assert_eq!(
                bus.publish(Event::from_candle(candle("BTCUSDT", t, true)))
                    .await,
                PublishOutcome::Enqueued
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, (1..=20).collect::<Vec<i64>>());
        bus.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn data_queue_overflow_drops_newest_and_counts() {
        let bus = EventBus::with_capacities(test_audit(), 2, 100, 50);
        // No drain task running — the queue fills up.
        for t in 1..=2 {
            assert_eq!(
                bus.try_publish(Event::from_candle(candle("BTCUSDT", t, true))),
                PublishOutcome::Enqueued
            );
        }
        assert_eq!(
            bus.try_publish(Event::from_candle(candle("BTCUSDT", 3, true))),
            PublishOutcome::Dropped
        );
        assert_eq!(bus.data_dropped(), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_drain() {
        let bus = EventBus::new(test_audit());
        let recorder = Recorder::new(Some(2));
        bus.subscribe(EventTag::CandleClosed, recorder.clone());
        bus.start();

        for t in 1..=3 {
            bus.publish(Event::from_candle(candle("BTCUSDT", t, true)))
                .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Event 2 failed; 1 and 3 were still delivered in order.
        assert_eq!(recorder.seen.lock().clone(), vec![1, 3]);
        bus.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_publishes() {
        let bus = EventBus::new(test_audit());
        bus.start();
        bus.shutdown(std::time::Duration::from_millis(100)).await;

        assert_eq!(
            bus.try_publish(Event::from_candle(candle("BTCUSDT", 1, true))),
            PublishOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn signal_events_route_to_signal_queue() {
        let sig = Signal::exit(
            SignalKind::ExitLong,
            "BTCUSDT",
            0,
            100.0,
            "test",
            crate::types::ExitReason::Manual,
        );
        let ev = Event::new(EventTag::SignalGenerated, EventPayload::Signal(sig));
        assert_eq!(ev.tag.queue(), QueueName::Signal);
        assert_eq!(EventTag::OrderFilled.queue(), QueueName::Order);
        assert_eq!(EventTag::CandleUpdate.queue(), QueueName::Data);
    }
}
