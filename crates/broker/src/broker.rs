//! Broker core and client connections.
//!
//! One `Broker` owns every queue behind a single mutex. Deliveries flow to
//! subscribers through unbounded channels; a subscriber only receives while
//! it has prefetch credit, and ready messages are handed out round-robin so
//! slow consumers never starve fast ones (fair dispatch).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::envelope::{Envelope, Headers};
use crate::error::{BrokerError, Result};
use crate::queue::QueueSpec;

/// A message handed to a consumer, identified by its delivery tag until
/// acked or nacked.
#[derive(Debug)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

struct SubscriberState {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: usize,
    outstanding: usize,
    auto_ack: bool,
    active: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    subscribers: Vec<SubscriberState>,
    rr_cursor: usize,
}

struct InFlight {
    queue: String,
    envelope: Envelope,
    subscriber: Option<u64>,
}

#[derive(Default)]
struct BrokerState {
    queues: IndexMap<String, QueueState>,
    in_flight: HashMap<u64, InFlight>,
    next_tag: u64,
    next_subscriber: u64,
}

/// The in-process broker.
pub struct Broker {
    state: Mutex<BrokerState>,
    open: AtomicBool,
    connections: AtomicU64,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            open: AtomicBool::new(true),
            connections: AtomicU64::new(0),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Tear the broker down. Every connection health check fails afterwards
    /// and every subscription drains to completion.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut state = self.lock();
        for (_, queue) in state.queues.iter_mut() {
            // Dropping the senders closes the delivery channels.
            queue.subscribers.clear();
        }
        info!("broker closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    /// Declare a queue. Redeclaration with the same spec is a no-op.
    pub fn declare(&self, spec: QueueSpec) -> Result<()> {
        self.check_open()?;
        let mut state = self.lock();
        if !state.queues.contains_key(&spec.name) {
            debug!(queue = %spec.name, durable = spec.durable, "queue declared");
            state.queues.insert(
                spec.name.clone(),
                QueueState {
                    spec,
                    ready: VecDeque::new(),
                    subscribers: Vec::new(),
                    rr_cursor: 0,
                },
            );
        }
        Ok(())
    }

    pub fn declare_topology(&self, specs: Vec<QueueSpec>) -> Result<()> {
        for spec in specs {
            self.declare(spec)?;
        }
        Ok(())
    }

    pub fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.check_open()?;
        let mut state = self.lock();
        enqueue_locked(&mut state, queue, envelope)?;
        dispatch_locked(&mut state, queue);
        Ok(())
    }

    /// Non-blocking single-message fetch (`basic_get`). With `auto_ack`
    /// false the message stays in flight until acked or nacked.
    pub fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>> {
        self.check_open()?;
        let mut state = self.lock();
        expire_locked(&mut state, queue)?;
        let state = &mut *state;
        let q = queue_mut(&mut state.queues, queue)?;
        let envelope = match q.ready.pop_front() {
            Some(envelope) => envelope,
            None => return Ok(None),
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            payload: envelope.payload.clone(),
            headers: envelope.headers.clone(),
        };
        if !auto_ack {
            state.in_flight.insert(
                tag,
                InFlight {
                    queue: queue.to_string(),
                    envelope,
                    subscriber: None,
                },
            );
        }
        Ok(Some(delivery))
    }

    /// Register a subscriber with the given prefetch credit.
    pub fn subscribe(
        broker: &Arc<Broker>,
        queue: &str,
        prefetch: usize,
        auto_ack: bool,
    ) -> Result<Subscription> {
        broker.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = broker.lock();
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            let q = queue_mut(&mut state.queues, queue)?;
            q.subscribers.push(SubscriberState {
                id,
                tx,
                prefetch: prefetch.max(1),
                outstanding: 0,
                auto_ack,
                active: true,
            });
            dispatch_locked(&mut state, queue);
            id
        };
        debug!(queue, subscriber = id, prefetch, "subscribed");
        Ok(Subscription {
            broker: Arc::clone(broker),
            queue: queue.to_string(),
            id,
            receiver: rx,
        })
    }

    fn cancel_subscriber(&self, queue: &str, id: u64) {
        let mut state = self.lock();
        if let Ok(q) = queue_mut(&mut state.queues, queue) {
            // In-flight tags survive cancellation; only delivery stops.
            q.subscribers.retain(|s| s.id != id);
        }
    }

    pub fn ack(&self, tag: u64) -> Result<()> {
        let mut state = self.lock();
        let in_flight = state
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        release_credit_locked(&mut state, &in_flight);
        dispatch_locked(&mut state, &in_flight.queue);
        Ok(())
    }

    /// Negative acknowledgement. `requeue` puts the message back at the head
    /// of its queue; otherwise it is dead-lettered (or dropped when the
    /// queue has no DLQ binding).
    pub fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let in_flight = state
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        release_credit_locked(&mut state, &in_flight);

        if requeue {
            let q = queue_mut(&mut state.queues, &in_flight.queue)?;
            q.ready.push_front(in_flight.envelope);
        } else {
            let dead_letter = queue_mut(&mut state.queues, &in_flight.queue)?
                .spec
                .dead_letter
                .clone();
            match dead_letter {
                Some(dlq) => {
                    debug!(queue = %in_flight.queue, dlq = %dlq, tag, "message dead-lettered");
                    enqueue_locked(&mut state, &dlq, in_flight.envelope)?;
                    dispatch_locked(&mut state, &dlq);
                }
                None => {
                    warn!(queue = %in_flight.queue, tag, "message rejected without DLQ, dropped");
                }
            }
        }
        dispatch_locked(&mut state, &in_flight.queue);
        Ok(())
    }

    /// Remove every ready message, returning how many were purged.
    pub fn purge(&self, queue: &str) -> Result<usize> {
        self.check_open()?;
        let mut state = self.lock();
        let q = queue_mut(&mut state.queues, queue)?;
        let purged = q.ready.len();
        q.ready.clear();
        if purged > 0 {
            info!(queue, purged, "queue purged");
        }
        Ok(purged)
    }

    /// Ready-message count (in-flight deliveries excluded).
    pub fn queue_size(&self, queue: &str) -> Result<usize> {
        let mut state = self.lock();
        expire_locked(&mut state, queue)?;
        let q = queue_mut(&mut state.queues, queue)?;
        Ok(q.ready.len())
    }

    pub(crate) fn register_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn queue_mut<'a>(
    queues: &'a mut IndexMap<String, QueueState>,
    name: &str,
) -> Result<&'a mut QueueState> {
    queues
        .get_mut(name)
        .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
}

/// Push respecting max-length: the oldest ready message overflows to the
/// queue's DLQ, or is dropped when it has none.
fn enqueue_locked(state: &mut BrokerState, queue: &str, envelope: Envelope) -> Result<()> {
    expire_locked(state, queue)?;
    let q = queue_mut(&mut state.queues, queue)?;
    let overflow = match q.spec.max_length {
        Some(max) if q.ready.len() >= max => q.ready.pop_front(),
        _ => None,
    };
    let dead_letter = q.spec.dead_letter.clone();
    q.ready.push_back(envelope);

    if let Some(old) = overflow {
        match dead_letter {
            Some(dlq) => {
                warn!(queue, dlq = %dlq, "queue over max-length, oldest message dead-lettered");
                enqueue_locked(state, &dlq, old)?;
                dispatch_locked(state, &dlq);
            }
            None => {
                debug!(queue, "queue over max-length, oldest message dropped");
            }
        }
    }
    Ok(())
}

/// Lazily evict expired messages from a TTL queue.
fn expire_locked(state: &mut BrokerState, queue: &str) -> Result<()> {
    let q = queue_mut(&mut state.queues, queue)?;
    if let Some(ttl) = q.spec.message_ttl {
        let now = Instant::now();
        while let Some(front) = q.ready.front() {
            if now.duration_since(front.enqueued_at) > ttl {
                q.ready.pop_front();
            } else {
                break;
            }
        }
    }
    Ok(())
}

fn release_credit_locked(state: &mut BrokerState, in_flight: &InFlight) {
    if let Some(sub_id) = in_flight.subscriber {
        if let Some(q) = state.queues.get_mut(&in_flight.queue) {
            if let Some(sub) = q.subscribers.iter_mut().find(|s| s.id == sub_id) {
                sub.outstanding = sub.outstanding.saturating_sub(1);
            }
        }
    }
}

/// Hand ready messages to subscribers with spare prefetch credit,
/// round-robin across subscribers.
fn dispatch_locked(state: &mut BrokerState, queue: &str) {
    let _ = expire_locked(state, queue);
    loop {
        let state_ref = &mut *state;
        let q = match state_ref.queues.get_mut(queue) {
            Some(q) => q,
            None => return,
        };
        if q.ready.is_empty() {
            return;
        }

        // Pick the next active subscriber with credit, starting at the
        // round-robin cursor.
        let n = q.subscribers.len();
        let mut chosen: Option<usize> = None;
        for offset in 0..n {
            let idx = (q.rr_cursor + offset) % n;
            let sub = &q.subscribers[idx];
            if sub.active && sub.outstanding < sub.prefetch {
                chosen = Some(idx);
                break;
            }
        }
        let idx = match chosen {
            Some(idx) => idx,
            None => return,
        };

        let envelope = match q.ready.pop_front() {
            Some(envelope) => envelope,
            None => return,
        };
        state_ref.next_tag += 1;
        let tag = state_ref.next_tag;
        let delivery = Delivery {
            tag,
            payload: envelope.payload.clone(),
            headers: envelope.headers.clone(),
        };

        let sub = &mut q.subscribers[idx];
        q.rr_cursor = (idx + 1) % n;
        match sub.tx.send(delivery) {
            Ok(()) => {
                if sub.auto_ack {
                    continue;
                }
                sub.outstanding += 1;
                let sub_id = sub.id;
                state_ref.in_flight.insert(
                    tag,
                    InFlight {
                        queue: queue.to_string(),
                        envelope,
                        subscriber: Some(sub_id),
                    },
                );
            }
            Err(_) => {
                // Receiver dropped; retire the subscriber and requeue.
                sub.active = false;
                q.ready.push_front(envelope);
            }
        }
    }
}

/// An active queue subscription. Dropping it cancels delivery.
pub struct Subscription {
    broker: Arc<Broker>,
    queue: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once cancelled and
    /// drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop receiving new deliveries. In-flight tags stay valid and must
    /// still be acked or nacked.
    pub fn cancel(&self) {
        self.broker.cancel_subscriber(&self.queue, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.cancel_subscriber(&self.queue, self.id);
    }
}

/// A client connection handle.
///
/// Connections are cheap in-process handles, but they keep the full
/// transport bookkeeping (creation time, last use, use count, liveness) so
/// pool policies behave exactly as they would against a socket transport.
pub struct Connection {
    broker: Arc<Broker>,
    id: u64,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    use_count: AtomicU64,
    open: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("use_count", &self.use_count)
            .field("open", &self.open)
            .finish()
    }
}

impl Connection {
    /// Connect with the configured retry policy (3 attempts, 2 s delay by
    /// default).
    pub async fn connect(broker: &Arc<Broker>, config: &BrokerConfig) -> Result<Self> {
        let attempts = config.connection_attempts.max(1);
        for attempt in 1..=attempts {
            if broker.is_open() {
                let id = broker.register_connection();
                debug!(
                    connection = id,
                    host = %config.host,
                    port = config.port,
                    heartbeat = config.heartbeat.as_secs(),
                    "connected to broker"
                );
                return Ok(Self {
                    broker: Arc::clone(broker),
                    id,
                    created_at: Instant::now(),
                    last_used_at: Mutex::new(Instant::now()),
                    use_count: AtomicU64::new(0),
                    open: AtomicBool::new(true),
                });
            }
            if attempt < attempts {
                warn!(attempt, attempts, "broker unreachable, retrying");
                tokio::time::sleep(config.retry_delay).await;
            }
        }
        Err(BrokerError::Unreachable { attempts })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        *self.last_used_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Transport health: both ends still open.
    pub fn is_healthy(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.broker.is_open()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn touch(&self) -> Result<()> {
        if !self.is_healthy() {
            return Err(BrokerError::ConnectionClosed);
        }
        *self.last_used_at.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn declare_topology(&self, specs: Vec<QueueSpec>) -> Result<()> {
        self.touch()?;
        self.broker.declare_topology(specs)
    }

    /// Serialize and publish a JSON payload.
    pub fn publish<T: Serialize>(&self, queue: &str, message: &T, persistent: bool) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(queue, payload, Headers::new(), persistent)
    }

    /// Publish raw payload bytes with explicit headers. Retry republication
    /// goes through here so payload bytes are preserved.
    pub fn publish_bytes(
        &self,
        queue: &str,
        payload: Vec<u8>,
        headers: Headers,
        persistent: bool,
    ) -> Result<()> {
        self.touch()?;
        self.broker
            .publish(queue, Envelope::new(payload, headers, persistent))
    }

    pub fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>> {
        self.touch()?;
        self.broker.get(queue, auto_ack)
    }

    pub fn subscribe(&self, queue: &str, prefetch: usize) -> Result<Subscription> {
        self.touch()?;
        Broker::subscribe(&self.broker, queue, prefetch, false)
    }

    pub fn subscribe_auto_ack(&self, queue: &str) -> Result<Subscription> {
        self.touch()?;
        Broker::subscribe(&self.broker, queue, usize::MAX, true)
    }

    pub fn ack(&self, tag: u64) -> Result<()> {
        self.touch()?;
        self.broker.ack(tag)
    }

    pub fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        self.touch()?;
        self.broker.nack(tag, requeue)
    }

    pub fn purge(&self, queue: &str) -> Result<usize> {
        self.touch()?;
        self.broker.purge(queue)
    }

    pub fn queue_size(&self, queue: &str) -> Result<usize> {
        self.touch()?;
        self.broker.queue_size(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::standard_topology;
    use crate::queues;
    use serde_json::json;

    fn setup() -> Arc<Broker> {
        let broker = Broker::new();
        broker.declare_topology(standard_topology()).unwrap();
        broker
    }

    fn envelope(payload: &str) -> Envelope {
        Envelope::new(payload.as_bytes().to_vec(), Headers::new(), true)
    }

    #[test]
    fn test_publish_get_ack() {
        let broker = setup();
        broker.publish(queues::SCENARIOS, envelope("a")).unwrap();
        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 1);

        let delivery = broker.get(queues::SCENARIOS, false).unwrap().unwrap();
        assert_eq!(delivery.payload, b"a");
        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 0);

        broker.ack(delivery.tag).unwrap();
        assert!(matches!(
            broker.ack(delivery.tag),
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[test]
    fn test_nack_requeue_preserves_order() {
        let broker = setup();
        broker.publish(queues::SCENARIOS, envelope("first")).unwrap();
        broker.publish(queues::SCENARIOS, envelope("second")).unwrap();

        let d = broker.get(queues::SCENARIOS, false).unwrap().unwrap();
        assert_eq!(d.payload, b"first");
        broker.nack(d.tag, true).unwrap();

        let d = broker.get(queues::SCENARIOS, false).unwrap().unwrap();
        assert_eq!(d.payload, b"first");
    }

    #[test]
    fn test_nack_without_requeue_dead_letters() {
        let broker = setup();
        broker.publish(queues::SCENARIOS, envelope("bad")).unwrap();
        let d = broker.get(queues::SCENARIOS, false).unwrap().unwrap();
        broker.nack(d.tag, false).unwrap();

        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 0);
        assert_eq!(broker.queue_size(queues::SCENARIOS_DLQ).unwrap(), 1);
        let dead = broker.get(queues::SCENARIOS_DLQ, true).unwrap().unwrap();
        assert_eq!(dead.payload, b"bad");
    }

    #[test]
    fn test_model_queue_max_length_one() {
        let broker = setup();
        broker.publish(queues::MODEL, envelope("old")).unwrap();
        broker.publish(queues::MODEL, envelope("new")).unwrap();
        assert_eq!(broker.queue_size(queues::MODEL).unwrap(), 1);
        let d = broker.get(queues::MODEL, true).unwrap().unwrap();
        assert_eq!(d.payload, b"new");
    }

    #[test]
    fn test_purge() {
        let broker = setup();
        for i in 0..5 {
            broker
                .publish(queues::SCENARIOS, envelope(&format!("{i}")))
                .unwrap();
        }
        assert_eq!(broker.purge(queues::SCENARIOS).unwrap(), 5);
        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 0);
    }

    #[test]
    fn test_unknown_queue() {
        let broker = Broker::new();
        assert!(matches!(
            broker.publish("nada", envelope("x")),
            Err(BrokerError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fair_dispatch_round_robin() {
        let broker = setup();
        let mut sub_a = Broker::subscribe(&broker, queues::SCENARIOS, 1, false).unwrap();
        let mut sub_b = Broker::subscribe(&broker, queues::SCENARIOS, 1, false).unwrap();

        for i in 0..4 {
            broker
                .publish(queues::SCENARIOS, envelope(&format!("{i}")))
                .unwrap();
        }

        // With prefetch 1 each subscriber holds exactly one delivery.
        let a1 = sub_a.recv().await.unwrap();
        let b1 = sub_b.recv().await.unwrap();
        assert!(sub_a.try_recv().is_none());
        assert!(sub_b.try_recv().is_none());

        // Credit released on ack pulls the next message.
        broker.ack(a1.tag).unwrap();
        let a2 = sub_a.recv().await.unwrap();
        broker.ack(b1.tag).unwrap();
        broker.ack(a2.tag).unwrap();
        let b2 = sub_b.recv().await.unwrap();
        broker.ack(b2.tag).unwrap();
    }

    #[tokio::test]
    async fn test_subscription_drop_requeues_undelivered() {
        let broker = setup();
        {
            let _sub = Broker::subscribe(&broker, queues::SCENARIOS, 1, false).unwrap();
        }
        // Subscriber dropped; a later publish must stay on the queue.
        broker.publish(queues::SCENARIOS, envelope("kept")).unwrap();
        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connection_retry_against_closed_broker() {
        let broker = setup();
        broker.close();
        let config = BrokerConfig {
            connection_attempts: 2,
            retry_delay: std::time::Duration::from_millis(10),
            ..BrokerConfig::default()
        };
        let err = Connection::connect(&broker, &config).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unreachable { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_connection_publish_json() {
        let broker = setup();
        let conn = Connection::connect(&broker, &BrokerConfig::default())
            .await
            .unwrap();
        conn.publish(queues::RESULTS, &json!({"escenario_id": 1}), true)
            .unwrap();
        assert_eq!(conn.queue_size(queues::RESULTS).unwrap(), 1);
        assert_eq!(conn.use_count(), 2);
        assert!(conn.is_healthy());
        broker.close();
        assert!(!conn.is_healthy());
    }

    #[test]
    fn test_ttl_eviction() {
        let broker = Broker::new();
        broker
            .declare(
                QueueSpec::transient("stats").with_ttl(std::time::Duration::from_millis(10)),
            )
            .unwrap();
        broker.publish("stats", envelope("old")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(broker.queue_size("stats").unwrap(), 0);
    }
}
