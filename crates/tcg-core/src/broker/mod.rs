//! Durable at-least-once publish/subscribe broker.
//!
//! A [`Broker`] assigns each published payload a sequence number per subject
//! and durably persists it via a [`Store`] (memory or file backed).
//! Subscribers are durable: a [`Subscription`] replays everything past its
//! persisted cursor, then tracks in-flight deliveries up to `max_in_flight`
//! and redelivers anything left unacked past `ack_wait`.

mod store;

pub use store::{FileStore, MemoryStore, Store};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::error::{Error, Result};

/// The fixed set of logical delivery streams used by the agent.
/// `Config` is the control-plane subject and may bypass the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// `send-events`
    SendEvents,
    /// `send-events-ack`
    SendEventsAck,
    /// `send-events-unack`
    SendEventsUnack,
    /// `send-resources-with-metrics`
    SendResourcesWithMetrics,
    /// `synchronize-inventory`
    SynchronizeInventory,
    /// `config` — control plane, may bypass the broker.
    Config,
}

impl Subject {
    /// The wire/storage name of this subject.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::SendEvents => "send-events",
            Subject::SendEventsAck => "send-events-ack",
            Subject::SendEventsUnack => "send-events-unack",
            Subject::SendResourcesWithMetrics => "send-resources-with-metrics",
            Subject::SynchronizeInventory => "synchronize-inventory",
            Subject::Config => "config",
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durably-sequenced message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic, per-subject, durable sequence number assigned by the
    /// broker.
    pub sequence: u64,
    /// The subject this message was published on.
    pub subject: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Broker-assigned publish time.
    pub timestamp: SystemTime,
}

/// Where a new durable subscription should begin reading from.
#[derive(Debug, Clone, Copy)]
pub enum StartPosition {
    /// Resume from the persisted cursor (the common case for re-subscribes
    /// after a classified failure).
    LastReceived,
    /// Replay the entire subject log.
    Earliest,
    /// Begin at (and including) a specific sequence number.
    Sequence(u64),
    /// Begin at the first message at or after a given time.
    Time(SystemTime),
}

/// Subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// How long an unacked message is held before being redelivered.
    pub ack_wait: Duration,
    /// Maximum number of concurrently undelivered (unacked) messages.
    pub max_in_flight: u32,
    /// Where to begin reading from.
    pub start_position: StartPosition,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(15),
            max_in_flight: 4,
            start_position: StartPosition::LastReceived,
        }
    }
}

/// A single in-flight delivery handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The delivered message.
    pub message: Message,
}

struct PendingEntry {
    message: Message,
    sent_at: Instant,
}

struct CursorState {
    cursor: u64,
    acked_ahead: BTreeSet<u64>,
}

/// A live, durable subscription handle.
///
/// Dropping or calling [`Subscription::close`] stops delivery; the durable
/// cursor persisted so far is left untouched, so a future `Subscribe` with
/// the same `durable_name` resumes where this one left off.
pub struct Subscription {
    durable_name: String,
    delivery_rx: mpsc::Receiver<Delivery>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<DashMap<u64, PendingEntry>>,
    cursor_state: Arc<Mutex<CursorState>>,
    save_cursor: Arc<dyn Fn(&str, u64) -> Result<()> + Send + Sync>,
    in_flight: Arc<Semaphore>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    /// Receive the next delivery. Returns `None` once the subscription has
    /// been closed and no further deliveries are pending.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.delivery_rx.recv().await
    }

    /// Acknowledge a message by sequence number. Frees its in-flight slot
    /// and advances the persisted cursor through the contiguous prefix of
    /// acknowledged sequences — a gap (an ack for sequence 5 while 3 is
    /// still outstanding) does not advance the cursor past 3, so a crash
    /// before 3 is acked redelivers 3..=5, guarded against reprocessing 5 by
    /// the dispatcher's done cache. This matches the "cursor never advances
    /// past an unacked message" invariant.
    pub fn ack(&self, sequence: u64) -> Result<()> {
        self.pending.remove(&sequence);
        self.in_flight.add_permits(1);

        let mut state = self.cursor_state.lock();
        state.acked_ahead.insert(sequence);
        while state.acked_ahead.contains(&(state.cursor + 1)) {
            state.cursor += 1;
            state.acked_ahead.remove(&state.cursor);
        }
        let cursor = state.cursor;
        drop(state);

        (self.save_cursor)(&self.durable_name, cursor)
    }

    /// Stop delivery. The durable cursor is preserved.
    pub fn close(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Embedded durable pub/sub broker.
pub struct Broker<S: Store + 'static> {
    store: Arc<S>,
    channels: DashMap<String, broadcast::Sender<Message>>,
    pub_semaphore: Arc<Semaphore>,
}

const LIVE_CHANNEL_CAPACITY: usize = 4096;

impl<S: Store + 'static> Broker<S> {
    /// Wrap a [`Store`] in a broker with the given publish back-pressure
    /// limit on outstanding publishes.
    pub fn new(store: S, max_pub_acks_in_flight: u32) -> Self {
        Self {
            store: Arc::new(store),
            channels: DashMap::new(),
            pub_semaphore: Arc::new(Semaphore::new(max_pub_acks_in_flight.max(1) as usize)),
        }
    }

    fn channel(&self, subject: &str) -> broadcast::Sender<Message> {
        self.channels
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Durably accept `payload` on `subject`, returning its assigned
    /// sequence number. Blocks if the configured number of publishes are
    /// already outstanding.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
        let _permit = self
            .pub_semaphore
            .acquire()
            .await
            .map_err(|_| Error::internal("publish semaphore closed"))?;

        let sender = self.channel(subject);
        let message = self.store.append(subject, payload)?;
        let _ = sender.send(message.clone());
        Ok(message.sequence)
    }

    /// Open a durable subscription. Replays anything past the resolved
    /// start position, then delivers live messages as they are published,
    /// redelivering unacked messages after `ack_wait`.
    pub fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
        options: SubscribeOptions,
    ) -> Subscription {
        let cursor = self.store.load_cursor(durable_name);
        let (after, initial_cursor) = match options.start_position {
            StartPosition::LastReceived => (cursor, cursor.unwrap_or(0)),
            StartPosition::Earliest => (None, 0),
            StartPosition::Sequence(n) => (Some(n.saturating_sub(1)), n.saturating_sub(1)),
            StartPosition::Time(_) => (None, 0),
        };

        let mut backlog = self.store.read_after(subject, after);
        if let StartPosition::Time(t) = options.start_position {
            backlog.retain(|m| m.timestamp >= t);
        }

        let (delivery_tx, delivery_rx) = mpsc::channel(options.max_in_flight.max(1) as usize * 2);
        let live_rx = self.channel(subject).subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending: Arc<DashMap<u64, PendingEntry>> = Arc::new(DashMap::new());
        let cursor_state = Arc::new(Mutex::new(CursorState {
            cursor: initial_cursor,
            acked_ahead: BTreeSet::new(),
        }));
        let in_flight = Arc::new(Semaphore::new(options.max_in_flight.max(1) as usize));

        let deliver_task = spawn_delivery_loop(
            backlog,
            live_rx,
            delivery_tx.clone(),
            shutdown.clone(),
            pending.clone(),
            in_flight.clone(),
        );
        let sweep_task = spawn_redelivery_sweep(
            pending.clone(),
            shutdown.clone(),
            options.ack_wait,
            delivery_tx,
        );

        let store = self.store.clone();
        let save_cursor: Arc<dyn Fn(&str, u64) -> Result<()> + Send + Sync> =
            Arc::new(move |durable_name: &str, sequence: u64| store.save_cursor(durable_name, sequence));

        Subscription {
            durable_name: durable_name.to_string(),
            delivery_rx,
            shutdown,
            pending,
            cursor_state,
            save_cursor,
            in_flight,
            tasks: vec![deliver_task, sweep_task],
        }
    }
}

fn spawn_delivery_loop(
    mut backlog: Vec<Message>,
    mut live_rx: broadcast::Receiver<Message>,
    delivery_tx: mpsc::Sender<Delivery>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<DashMap<u64, PendingEntry>>,
    in_flight: Arc<Semaphore>,
) -> tokio::task::JoinHandle<()> {
    // The broadcast receiver is opened before draining `backlog`'s source
    // read, so nothing published concurrently with subscribe is lost; the
    // highest backlog sequence is used to drop the resulting duplicate.
    let mut last_backlog_sequence = backlog.last().map(|m| m.sequence).unwrap_or(0);

    tokio::spawn(async move {
        backlog.sort_by_key(|m| m.sequence);
        for message in backlog {
            if deliver_one(
                message,
                &delivery_tx,
                &pending,
                &in_flight,
                &shutdown,
            )
            .await
            .is_err()
            {
                return;
            }
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match live_rx.recv().await {
                Ok(message) => {
                    if message.sequence <= last_backlog_sequence {
                        continue;
                    }
                    last_backlog_sequence = last_backlog_sequence.max(message.sequence);
                    if deliver_one(message, &delivery_tx, &pending, &in_flight, &shutdown)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

async fn deliver_one(
    message: Message,
    delivery_tx: &mpsc::Sender<Delivery>,
    pending: &Arc<DashMap<u64, PendingEntry>>,
    in_flight: &Arc<Semaphore>,
    shutdown: &Arc<AtomicBool>,
) -> std::result::Result<(), ()> {
    let permit = match in_flight.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(()),
    };
    // The permit is released on ack (`Subscription::ack`); forgetting it
    // here keeps the slot occupied until then.
    permit.forget();

    if shutdown.load(Ordering::SeqCst) {
        return Err(());
    }

    pending.insert(
        message.sequence,
        PendingEntry {
            message: message.clone(),
            sent_at: Instant::now(),
        },
    );

    delivery_tx
        .send(Delivery { message })
        .await
        .map_err(|_| ())
}

fn spawn_redelivery_sweep(
    pending: Arc<DashMap<u64, PendingEntry>>,
    shutdown: Arc<AtomicBool>,
    ack_wait: Duration,
    delivery_tx: mpsc::Sender<Delivery>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let tick = (ack_wait / 2).max(Duration::from_millis(50));
        loop {
            tokio::time::sleep(tick).await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            let mut expired: Vec<Message> = Vec::new();
            for mut entry in pending.iter_mut() {
                if now.duration_since(entry.sent_at) >= ack_wait {
                    expired.push(entry.message.clone());
                    entry.sent_at = now;
                }
            }
            // The in-flight permit for each of these was never released (no
            // ack arrived), so redelivery re-sends through the same channel
            // without acquiring a new one; `sent_at` above was already reset
            // to restart its `ack_wait` window.
            for message in expired {
                if delivery_tx.send(Delivery { message }).await.is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryStore;

    fn broker() -> Broker<MemoryStore> {
        Broker::new(MemoryStore::new(), 16)
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_in_order() {
        let broker = broker();
        broker.publish("events", b"p1".to_vec()).await.unwrap();
        broker.publish("events", b"p2".to_vec()).await.unwrap();

        let mut sub = broker.subscribe(
            "events",
            "worker-1",
            SubscribeOptions::default(),
        );

        let first = sub.recv().await.unwrap();
        assert_eq!(first.message.payload, b"p1");
        sub.ack(first.message.sequence).unwrap();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.message.payload, b"p2");
        sub.ack(second.message.sequence).unwrap();

        sub.close();
    }

    #[tokio::test]
    async fn subscribe_replays_unacked_after_resubscribe() {
        let broker = broker();
        broker.publish("events", b"p1".to_vec()).await.unwrap();
        broker.publish("events", b"p2".to_vec()).await.unwrap();
        broker.publish("events", b"p3".to_vec()).await.unwrap();

        {
            let mut sub = broker.subscribe("events", "worker-1", SubscribeOptions::default());
            let first = sub.recv().await.unwrap();
            assert_eq!(first.message.payload, b"p1");
            sub.ack(first.message.sequence).unwrap();
            sub.close();
        }

        let mut sub = broker.subscribe("events", "worker-1", SubscribeOptions::default());
        let next = sub.recv().await.unwrap();
        assert_eq!(next.message.payload, b"p2");
        sub.close();
    }

    #[tokio::test]
    async fn cursor_does_not_advance_past_a_gap() {
        let broker = broker();
        broker.publish("events", b"p1".to_vec()).await.unwrap();
        broker.publish("events", b"p2".to_vec()).await.unwrap();
        broker.publish("events", b"p3".to_vec()).await.unwrap();

        let options = SubscribeOptions {
            max_in_flight: 3,
            ..SubscribeOptions::default()
        };
        let mut sub = broker.subscribe("events", "worker-1", options);

        let m1 = sub.recv().await.unwrap().message;
        let m2 = sub.recv().await.unwrap().message;
        let m3 = sub.recv().await.unwrap().message;

        // Ack 3 before 1 and 2: the cursor must stay below 1 since it is
        // the first gap, even though a later sequence was handled.
        sub.ack(m3.sequence).unwrap();
        assert_eq!(broker.store.load_cursor("worker-1"), Some(0));

        sub.ack(m1.sequence).unwrap();
        assert_eq!(broker.store.load_cursor("worker-1"), Some(1));

        sub.ack(m2.sequence).unwrap();
        assert_eq!(broker.store.load_cursor("worker-1"), Some(3));

        sub.close();
    }

    #[tokio::test]
    async fn max_in_flight_limits_concurrent_deliveries() {
        let broker = broker();
        for i in 0..5u8 {
            broker.publish("events", vec![i]).await.unwrap();
        }

        let options = SubscribeOptions {
            max_in_flight: 2,
            ..SubscribeOptions::default()
        };
        let mut sub = broker.subscribe("events", "worker-1", options);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();

        // The third delivery should not arrive until a permit is freed.
        let third = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(third.is_err(), "expected no delivery while at max_in_flight");

        sub.ack(first.message.sequence).unwrap();
        let third = sub.recv().await.unwrap();
        assert_eq!(third.message.payload, vec![2]);

        sub.ack(second.message.sequence).unwrap();
        sub.ack(third.message.sequence).unwrap();
        sub.close();
    }

    #[tokio::test]
    async fn publishing_the_same_payload_twice_yields_independent_sequences() {
        let broker = broker();
        let s1 = broker.publish("events", b"same".to_vec()).await.unwrap();
        let s2 = broker.publish("events", b"same".to_vec()).await.unwrap();
        assert_ne!(s1, s2);
    }

    #[tokio::test]
    async fn earliest_start_position_replays_from_the_beginning() {
        let broker = broker();
        broker.publish("events", b"p1".to_vec()).await.unwrap();

        {
            let mut sub = broker.subscribe("events", "worker-1", SubscribeOptions::default());
            let m = sub.recv().await.unwrap().message;
            sub.ack(m.sequence).unwrap();
            sub.close();
        }

        broker.publish("events", b"p2".to_vec()).await.unwrap();

        let options = SubscribeOptions {
            start_position: StartPosition::Earliest,
            ..SubscribeOptions::default()
        };
        let mut sub = broker.subscribe("events", "worker-2", options);
        let first = sub.recv().await.unwrap();
        assert_eq!(first.message.payload, b"p1");
        sub.close();
    }
}
