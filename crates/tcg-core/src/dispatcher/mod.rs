//! Dispatcher: owns worker subscriptions, deduplicates delivery, classifies
//! failures and retries.

mod retry;

pub use retry::{RetryState, TERMINAL_ATTEMPT};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{Broker, StartPosition, Store, SubscribeOptions};
use crate::cache::{Cache, CacheConfig, MemoryCache};
use crate::error::{Error, Result};

/// Default TTL for the done cache: `durable_name#sequence` entries guard
/// against reprocessing a redelivered-but-already-handled message.
const DONE_CACHE_TTL: Duration = Duration::from_secs(600);

type HandlerFn = dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync;

/// A durable subscription plus the handler invoked for each of its messages.
#[derive(Clone)]
pub struct Worker {
    /// Durable subscription name; also the dedup/retry cache key.
    pub durable_name: String,
    /// Broker subject to subscribe to.
    pub subject: String,
    handler: Arc<HandlerFn>,
}

impl Worker {
    /// Build a worker from an async handler.
    pub fn new<F, Fut>(durable_name: impl Into<String>, subject: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            durable_name: durable_name.into(),
            subject: subject.into(),
            handler: Arc::new(move |payload| Box::pin(handler(payload))),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("durable_name", &self.durable_name)
            .field("subject", &self.subject)
            .finish()
    }
}

struct RegistryEntry {
    task: JoinHandle<()>,
}

/// Owns the worker registry and subscription lifecycle over a [`Broker`].
pub struct Dispatcher<S: Store + 'static> {
    broker: Arc<Broker<S>>,
    ack_wait: Duration,
    max_in_flight: u32,
    registry: Arc<DashMap<String, RegistryEntry>>,
    retry_cache: Arc<MemoryCache>,
    done_cache: Arc<MemoryCache>,
    control: Mutex<Option<Running>>,
}

struct Running {
    control_tx: mpsc::UnboundedSender<Worker>,
    control_task: JoinHandle<()>,
    shutdown: Arc<crate::shutdown::GracefulShutdown>,
}

impl<S: Store + 'static> Dispatcher<S> {
    /// Build a dispatcher over `broker` using the given default subscribe
    /// options.
    pub fn new(broker: Arc<Broker<S>>, ack_wait: Duration, max_in_flight: u32) -> Self {
        Self {
            broker,
            ack_wait,
            max_in_flight,
            registry: Arc::new(DashMap::new()),
            retry_cache: Arc::new(MemoryCache::with_config(
                CacheConfig::new().default_ttl(retry::RETRY_CACHE_TTL),
            )),
            done_cache: Arc::new(MemoryCache::with_config(
                CacheConfig::new().default_ttl(DONE_CACHE_TTL),
            )),
            control: Mutex::new(None),
        }
    }

    /// Durable names currently present in the worker registry.
    pub fn active_workers(&self) -> Vec<String> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    /// Tears down any previous dispatcher, opens a single control channel,
    /// and emits each worker onto it.
    pub async fn start(&self, workers: Vec<Worker>) -> Result<()> {
        self.stop().await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel::<Worker>();
        let shutdown = Arc::new(crate::shutdown::GracefulShutdown::new());

        let control_task = tokio::spawn(control_loop(
            control_rx,
            self.broker.clone(),
            self.registry.clone(),
            self.retry_cache.clone(),
            self.done_cache.clone(),
            control_tx.clone(),
            shutdown.clone(),
            SubscribeOptions {
                ack_wait: self.ack_wait,
                max_in_flight: self.max_in_flight,
                start_position: StartPosition::LastReceived,
            },
        ));

        *self.control.lock() = Some(Running {
            control_tx: control_tx.clone(),
            control_task,
            shutdown,
        });

        for worker in workers {
            control_tx
                .send(worker)
                .map_err(|_| Error::internal("dispatcher control channel closed"))?;
        }
        Ok(())
    }

    /// Flushes the worker registry and closes the consumer connection.
    /// Durable cursors are preserved by the broker.
    pub async fn stop(&self) -> Result<()> {
        let running = self.control.lock().take();
        if let Some(running) = running {
            running.shutdown.shutdown();
            running.control_task.abort();
        }
        for mut entry in self.registry.iter_mut() {
            entry.task.abort();
        }
        self.registry.clear();
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn control_loop<S: Store + 'static>(
    mut rx: mpsc::UnboundedReceiver<Worker>,
    broker: Arc<Broker<S>>,
    registry: Arc<DashMap<String, RegistryEntry>>,
    retry_cache: Arc<MemoryCache>,
    done_cache: Arc<MemoryCache>,
    control_tx: mpsc::UnboundedSender<Worker>,
    shutdown: Arc<crate::shutdown::GracefulShutdown>,
    options: SubscribeOptions,
) {
    while let Some(worker) = rx.recv().await {
        if registry.contains_key(&worker.durable_name) {
            // Dedup of control-plane requests.
            continue;
        }

        let subscription = broker.subscribe(&worker.subject, &worker.durable_name, options.clone());
        let task = tokio::spawn(run_worker(
            worker.clone(),
            subscription,
            registry.clone(),
            retry_cache.clone(),
            done_cache.clone(),
            control_tx.clone(),
            shutdown.token(),
        ));
        registry.insert(worker.durable_name.clone(), RegistryEntry { task });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<S: Store + 'static>(
    worker: Worker,
    mut subscription: crate::broker::Subscription,
    registry: Arc<DashMap<String, RegistryEntry>>,
    retry_cache: Arc<MemoryCache>,
    done_cache: Arc<MemoryCache>,
    control_tx: mpsc::UnboundedSender<Worker>,
    mut shutdown_token: crate::shutdown::ShutdownToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown_token.cancelled() => return,
            delivery = subscription.recv() => delivery,
        };
        let Some(delivery) = delivery else { return };
        let message = delivery.message;
        let done_key = format!("{}#{}", worker.durable_name, message.sequence);

        if done_cache.exists(&done_key).await {
            let _ = subscription.ack(message.sequence);
            continue;
        }

        match (worker.handler)(message.payload.clone()).await {
            Ok(()) => {
                if let Err(err) = subscription.ack(message.sequence) {
                    error!(durable_name = %worker.durable_name, error = %err, "failed to persist ack");
                }
                done_cache.set(&done_key, &true, Some(DONE_CACHE_TTL)).await;
                retry_cache.delete(&worker.durable_name).await;
                info!(durable_name = %worker.durable_name, sequence = message.sequence, "message handled");
            }
            Err(err) if err.is_retriable() => {
                registry.remove(&worker.durable_name);
                subscription.close();

                let existing: Option<RetryState> = retry_cache.get(&worker.durable_name).await;
                let state = match existing {
                    Some(state) => state.bump(err.message()),
                    None => RetryState::first(err.message()),
                };

                if state.is_terminal() {
                    retry_cache.delete(&worker.durable_name).await;
                    error!(
                        durable_name = %worker.durable_name,
                        attempts = state.attempt,
                        "retries exhausted, worker terminated"
                    );
                } else {
                    let delay = state.delay();
                    let ttl = state.remaining_ttl();
                    retry_cache.set(&worker.durable_name, &state, Some(ttl)).await;
                    warn!(
                        durable_name = %worker.durable_name,
                        attempt = state.attempt,
                        delay_secs = delay.as_secs(),
                        "retriable failure, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let _ = control_tx.send(worker.clone());
                        }
                        _ = shutdown_token.cancelled() => {}
                    }
                }
                return;
            }
            Err(err) => {
                error!(
                    durable_name = %worker.durable_name,
                    error = %err,
                    "terminal failure, message left unacked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> Dispatcher<MemoryStore> {
        Dispatcher::new(
            Arc::new(Broker::new(MemoryStore::new(), 16)),
            Duration::from_secs(15),
            4,
        )
    }

    #[tokio::test]
    async fn successful_handler_acks_and_populates_done_cache() {
        let dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let worker = Worker::new("w1", "events", move |_payload| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        dispatcher.broker.publish("events", b"p1".to_vec()).await.unwrap();
        dispatcher.start(vec![worker]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.done_cache.exists("w1#1").await);

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_control_records_are_deduplicated() {
        let dispatcher = dispatcher();
        let worker_a = Worker::new("w1", "events", |_| async { Ok(()) });
        let worker_b = Worker::new("w1", "events", |_| async { Ok(()) });

        dispatcher.start(vec![worker_a, worker_b]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(dispatcher.active_workers(), vec!["w1".to_string()]);
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retriable_failure_then_success_clears_retry_state() {
        let dispatcher = dispatcher();
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();

        let worker = Worker::new("w1", "events", move |_payload| {
            let attempt = attempt_clone.clone();
            async move {
                if attempt.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::gateway("upstream unavailable"))
                } else {
                    Ok(())
                }
            }
        });

        dispatcher.broker.publish("events", b"p1".to_vec()).await.unwrap();
        dispatcher.start(vec![worker]).await.unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.active_workers().contains(&"w1".to_string()));

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;

        assert_eq!(attempt.load(Ordering::SeqCst), 2);
        assert!(dispatcher.done_cache.exists("w1#1").await);
        assert!(dispatcher.retry_cache.get::<RetryState>("w1").await.is_none());

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_clears_the_registry() {
        let dispatcher = dispatcher();
        let worker = Worker::new("w1", "events", |_| async { Ok(()) });
        dispatcher.start(vec![worker]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        dispatcher.stop().await.unwrap();
        assert!(dispatcher.active_workers().is_empty());
    }
}
