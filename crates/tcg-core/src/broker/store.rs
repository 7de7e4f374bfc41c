//! Durable and volatile storage backends for the broker.
//!
//! `MemoryStore` keeps everything in an in-process index and is used for
//! tests and ephemeral deployments. `FileStore` keeps the same index but
//! backs it with an append-only per-subject log and per-durable cursor
//! files, replayed on construction, so state survives a restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use super::Message;
use crate::error::{Error, Result};

/// Durability backend for the broker. Implementors own both the
/// append-and-assign-sequence path and cursor persistence.
pub trait Store: Send + Sync {
    /// Append `payload` to `subject`, assigning the next sequence number.
    fn append(&self, subject: &str, payload: Vec<u8>) -> Result<Message>;

    /// All messages for `subject` with `sequence > after` (or all of them,
    /// if `after` is `None`), in sequence order.
    fn read_after(&self, subject: &str, after: Option<u64>) -> Vec<Message>;

    /// The last acknowledged sequence for a durable subscription, if any.
    fn load_cursor(&self, durable_name: &str) -> Option<u64>;

    /// Persist the last acknowledged sequence for a durable subscription.
    fn save_cursor(&self, durable_name: &str, sequence: u64) -> Result<()>;
}

/// Shared in-memory representation used by both backends.
struct Index {
    subjects: RwLock<HashMap<String, Vec<Message>>>,
    sequences: RwLock<HashMap<String, Arc<AtomicU64>>>,
    cursors: RwLock<HashMap<String, u64>>,
}

impl Index {
    fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            sequences: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn next_sequence(&self, subject: &str) -> u64 {
        let counter = self
            .sequences
            .write()
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe_sequence(&self, subject: &str, sequence: u64) {
        let counter = self
            .sequences
            .write()
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_max(sequence, Ordering::SeqCst);
    }

    fn insert(&self, message: Message) {
        self.subjects
            .write()
            .entry(message.subject.clone())
            .or_default()
            .push(message);
    }

    fn read_after(&self, subject: &str, after: Option<u64>) -> Vec<Message> {
        let after = after.unwrap_or(0);
        self.subjects
            .read()
            .get(subject)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Volatile store: nothing survives process exit. Used for tests and the
/// `StoreType::Memory` configuration.
pub struct MemoryStore {
    index: Index,
}

impl MemoryStore {
    /// Create a fresh, empty in-memory store.
    pub fn new() -> Self {
        Self { index: Index::new() }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn append(&self, subject: &str, payload: Vec<u8>) -> Result<Message> {
        let sequence = self.index.next_sequence(subject);
        let message = Message {
            sequence,
            subject: subject.to_string(),
            payload,
            timestamp: SystemTime::now(),
        };
        self.index.insert(message.clone());
        Ok(message)
    }

    fn read_after(&self, subject: &str, after: Option<u64>) -> Vec<Message> {
        self.index.read_after(subject, after)
    }

    fn load_cursor(&self, durable_name: &str) -> Option<u64> {
        self.index.cursors.read().get(durable_name).copied()
    }

    fn save_cursor(&self, durable_name: &str, sequence: u64) -> Result<()> {
        self.index
            .cursors
            .write()
            .insert(durable_name.to_string(), sequence);
        Ok(())
    }
}

/// Disk-backed store. Layout: one append-only `<subject>.log` file
/// per subject holding length-prefixed JSON-encoded [`Message`] records in
/// write order, and one `<durable_name>.cursor` file per durable
/// subscription holding the last-acknowledged sequence as a decimal integer,
/// fsynced on every ack.
pub struct FileStore {
    dir: PathBuf,
    index: Index,
    logs: Mutex<HashMap<String, File>>,
}

impl FileStore {
    /// Open (or create) a file store rooted at `dir`, replaying any
    /// existing subject logs and cursor files found there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("creating filestore dir: {e}")))?;

        let index = Index::new();
        let mut logs = HashMap::new();

        for entry in fs::read_dir(&dir)
            .map_err(|e| Error::internal(format!("reading filestore dir: {e}")))?
        {
            let entry = entry.map_err(|e| Error::internal(format!("reading dir entry: {e}")))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(subject) = file_name.strip_suffix(".log") {
                let messages = replay_log(&path)?;
                for message in &messages {
                    index.observe_sequence(subject, message.sequence);
                }
                index
                    .subjects
                    .write()
                    .insert(subject.to_string(), messages);

                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .map_err(|e| Error::internal(format!("opening subject log: {e}")))?;
                logs.insert(subject.to_string(), file);
            } else if let Some(durable_name) = file_name.strip_suffix(".cursor") {
                let sequence = read_cursor_file(&path)?;
                index
                    .cursors
                    .write()
                    .insert(durable_name.to_string(), sequence);
            }
        }

        Ok(Self {
            dir,
            index,
            logs: Mutex::new(logs),
        })
    }

    fn log_path(&self, subject: &str) -> PathBuf {
        self.dir.join(format!("{subject}.log"))
    }

    fn cursor_path(&self, durable_name: &str) -> PathBuf {
        self.dir.join(format!("{durable_name}.cursor"))
    }
}

impl Store for FileStore {
    fn append(&self, subject: &str, payload: Vec<u8>) -> Result<Message> {
        let sequence = self.index.next_sequence(subject);
        let message = Message {
            sequence,
            subject: subject.to_string(),
            payload,
            timestamp: SystemTime::now(),
        };

        let encoded = serde_json::to_vec(&message)
            .map_err(|e| Error::internal(format!("encoding message: {e}")))?;

        let mut logs = self.logs.lock();
        let file = match logs.get_mut(subject) {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(self.log_path(subject))
                    .map_err(|e| Error::internal(format!("opening subject log: {e}")))?;
                logs.entry(subject.to_string()).or_insert(file)
            }
        };

        write_record(file, &encoded)
            .map_err(|e| Error::internal(format!("appending to subject log: {e}")))?;

        self.index.insert(message.clone());
        Ok(message)
    }

    fn read_after(&self, subject: &str, after: Option<u64>) -> Vec<Message> {
        self.index.read_after(subject, after)
    }

    fn load_cursor(&self, durable_name: &str) -> Option<u64> {
        self.index.cursors.read().get(durable_name).copied()
    }

    fn save_cursor(&self, durable_name: &str, sequence: u64) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.cursor_path(durable_name))
            .map_err(|e| Error::internal(format!("opening cursor file: {e}")))?;
        file.write_all(sequence.to_string().as_bytes())
            .map_err(|e| Error::internal(format!("writing cursor file: {e}")))?;
        file.sync_all()
            .map_err(|e| Error::internal(format!("fsyncing cursor file: {e}")))?;

        self.index
            .cursors
            .write()
            .insert(durable_name.to_string(), sequence);
        Ok(())
    }
}

fn write_record(file: &mut File, encoded: &[u8]) -> std::io::Result<()> {
    let len = (encoded.len() as u32).to_le_bytes();
    file.write_all(&len)?;
    file.write_all(encoded)?;
    file.sync_data()
}

fn replay_log(path: &Path) -> Result<Vec<Message>> {
    let mut file =
        File::open(path).map_err(|e| Error::internal(format!("opening subject log: {e}")))?;
    let mut messages = Vec::new();

    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::internal(format!("reading subject log: {e}"))),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::internal(format!("reading subject log record: {e}")))?;
        let message: Message = serde_json::from_slice(&buf)
            .map_err(|e| Error::internal(format!("decoding subject log record: {e}")))?;
        messages.push(message);
    }

    Ok(messages)
}

fn read_cursor_file(path: &Path) -> Result<u64> {
    let contents =
        fs::read_to_string(path).map_err(|e| Error::internal(format!("reading cursor file: {e}")))?;
    contents
        .trim()
        .parse()
        .map_err(|e| Error::internal(format!("parsing cursor file: {e}")))
}
