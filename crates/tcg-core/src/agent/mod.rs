//! Agent service: owns process-wide transport state and reacts to
//! configuration changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::broker::{Broker, FileStore, MemoryStore};
use crate::config::{Config, StoreType};
use crate::dispatcher::Dispatcher;
use crate::error::Result;

#[cfg(feature = "http-client")]
use crate::dispatcher::Worker;
#[cfg(feature = "http-client")]
use crate::groundwork::GroundworkClient;

/// User-visible transport state. Stands in for the out-of-scope
/// control-plane `/status` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// No configuration has been applied yet, or the last one was stopped.
    Stopped,
    /// A dispatcher is running against the current configuration.
    Running,
}

/// The broker and dispatcher pair for whichever [`StoreType`] the current
/// configuration selects. Erases the `Store` type parameter behind an enum
/// rather than a trait object, since `Broker`/`Dispatcher` carry no other
/// generic surface that would benefit from dynamic dispatch.
enum Transport {
    Memory {
        broker: Arc<Broker<MemoryStore>>,
        dispatcher: Dispatcher<MemoryStore>,
    },
    File {
        broker: Arc<Broker<FileStore>>,
        dispatcher: Dispatcher<FileStore>,
    },
}

impl Transport {
    async fn stop(&self) -> Result<()> {
        match self {
            Transport::Memory { dispatcher, .. } => dispatcher.stop().await,
            Transport::File { dispatcher, .. } => dispatcher.stop().await,
        }
    }
}

/// Owns the broker, dispatcher, and Groundwork client lifecycle, and maps
/// configured endpoints onto the fixed worker set.
pub struct AgentService {
    checksum: AtomicU64,
    transport: Mutex<Option<Transport>>,
    #[cfg(feature = "http-client")]
    groundwork: Mutex<Option<Arc<GroundworkClient>>>,
    status: Mutex<AgentStatus>,
}

impl AgentService {
    /// A freshly constructed, unconfigured agent.
    pub fn new() -> Self {
        Self {
            checksum: AtomicU64::new(0),
            transport: Mutex::new(None),
            #[cfg(feature = "http-client")]
            groundwork: Mutex::new(None),
            status: Mutex::new(AgentStatus::Stopped),
        }
    }

    /// Current transport state.
    pub fn status(&self) -> AgentStatus {
        *self.status.lock()
    }

    /// Apply a new configuration. A checksum comparison against the
    /// currently-applied configuration makes this a no-op when nothing
    /// relevant changed; otherwise the HTTP client is reinitialized and the
    /// dispatcher is restarted with the fixed worker set.
    pub async fn apply_config(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;

        let new_checksum = new_config.checksum();
        if new_checksum == self.checksum.load(Ordering::SeqCst) && self.transport.lock().is_some() {
            info!("configuration unchanged, ignoring");
            return Ok(());
        }

        if let Some(previous) = self.transport.lock().take() {
            previous.stop().await?;
        }

        #[cfg(feature = "http-client")]
        let client = Arc::new(GroundworkClient::new(
            &new_config.groundwork.host,
            &new_config.groundwork.app_name,
            &new_config.groundwork.user,
            &new_config.groundwork.password,
        ));
        #[cfg(feature = "http-client")]
        {
            *self.groundwork.lock() = Some(client.clone());
        }

        let transport = match new_config.store_type {
            StoreType::Memory => {
                let broker = Arc::new(Broker::new(MemoryStore::new(), new_config.max_pub_acks_in_flight));
                let dispatcher = Dispatcher::new(
                    broker.clone(),
                    new_config.dispatcher_ack_wait,
                    new_config.dispatcher_max_in_flight,
                );
                #[cfg(feature = "http-client")]
                dispatcher.start(worker_table(client.clone())).await?;
                Transport::Memory { broker, dispatcher }
            }
            StoreType::File => {
                let store = FileStore::open(&new_config.filestore_dir)?;
                let broker = Arc::new(Broker::new(store, new_config.max_pub_acks_in_flight));
                let dispatcher = Dispatcher::new(
                    broker.clone(),
                    new_config.dispatcher_ack_wait,
                    new_config.dispatcher_max_in_flight,
                );
                #[cfg(feature = "http-client")]
                dispatcher.start(worker_table(client.clone())).await?;
                Transport::File { broker, dispatcher }
            }
        };

        *self.transport.lock() = Some(transport);
        self.checksum.store(new_checksum, Ordering::SeqCst);
        *self.status.lock() = AgentStatus::Running;
        Ok(())
    }

    /// Stop the dispatcher, if running. The underlying broker's durable
    /// state is untouched.
    pub async fn stop(&self) -> Result<()> {
        if let Some(transport) = self.transport.lock().take() {
            transport.stop().await?;
        }
        *self.status.lock() = AgentStatus::Stopped;
        Ok(())
    }
}

impl Default for AgentService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http-client")]
fn worker_table(client: Arc<GroundworkClient>) -> Vec<Worker> {
    vec![
        {
            let client = client.clone();
            Worker::new("send-events", "send-events", move |payload| {
                let client = client.clone();
                async move { client.send_events(payload).await.map(|_| ()) }
            })
        },
        {
            let client = client.clone();
            Worker::new("send-events-ack", "send-events-ack", move |payload| {
                let client = client.clone();
                async move { client.send_events_ack(payload).await.map(|_| ()) }
            })
        },
        {
            let client = client.clone();
            Worker::new("send-events-unack", "send-events-unack", move |payload| {
                let client = client.clone();
                async move { client.send_events_unack(payload).await.map(|_| ()) }
            })
        },
        {
            let client = client.clone();
            Worker::new(
                "send-resources-with-metrics",
                "send-resources-with-metrics",
                move |payload| {
                    let client = client.clone();
                    async move { client.send_resources_with_metrics(payload).await.map(|_| ()) }
                },
            )
        },
        {
            let client = client.clone();
            Worker::new(
                "synchronize-inventory",
                "synchronize-inventory",
                move |payload| {
                    let client = client.clone();
                    async move { client.synchronize_inventory(payload).await.map(|_| ()) }
                },
            )
        },
    ]
}
