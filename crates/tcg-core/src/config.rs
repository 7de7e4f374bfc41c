//! In-memory configuration surface
//!
//! This module deliberately does not parse TOML/YAML/env files — only the
//! in-memory shape configuration takes once it reaches the core, plus
//! validation and a checksum the agent service uses to detect change.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broker storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    /// Volatile, in-process store. Used in tests and ephemeral deployments.
    Memory,
    /// Disk-backed store; durable across restarts.
    File,
}

/// Connection details for the downstream Groundwork API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundworkConnection {
    /// Base host, e.g. `https://my-groundwork.example.com` or the local
    /// sentinel host used by the legacy local auth flow.
    pub host: String,
    /// Application name sent as `GWOS-APP-NAME`.
    pub app_name: String,
    /// Username for the remote JSON auth flow / `user` field of the local
    /// form auth flow.
    pub user: String,
    /// Password for the auth flow.
    pub password: String,
}

/// Core transport subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Duration the broker waits for an ack before redelivering. Default
    /// 15s.
    pub dispatcher_ack_wait: Duration,
    /// Maximum concurrent unacked messages per subscription. Default 4.
    pub dispatcher_max_in_flight: u32,
    /// Maximum outstanding publish acks before `Publish` blocks.
    pub max_pub_acks_in_flight: u32,
    /// Directory backing the `File` store.
    pub filestore_dir: PathBuf,
    /// Broker storage backend.
    pub store_type: StoreType,
    /// `host:port` of the embedded broker (informational; the broker is
    /// in-process, this mirrors the original source's configuration shape).
    pub nats_host: String,
    /// Groundwork connection details.
    pub groundwork: GroundworkConnection,
}

impl Config {
    /// Validate the configuration, returning [`Error::Config`] on the first
    /// problem found.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher_max_in_flight == 0 {
            return Err(Error::config("dispatcher_max_in_flight must be >= 1"));
        }
        if self.max_pub_acks_in_flight == 0 {
            return Err(Error::config("max_pub_acks_in_flight must be >= 1"));
        }
        if self.store_type == StoreType::File && self.filestore_dir.as_os_str().is_empty() {
            return Err(Error::config("filestore_dir is required for the File store"));
        }
        if self.groundwork.host.trim().is_empty() {
            return Err(Error::config("groundwork.host must not be empty"));
        }
        if self.groundwork.app_name.trim().is_empty() {
            return Err(Error::config("groundwork.app_name must not be empty"));
        }
        Ok(())
    }

    /// A stable checksum over the configuration, used by the agent service
    /// to detect whether a new configuration actually changed anything. Not
    /// cryptographic — just stable across process runs for the same values.
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.dispatcher_ack_wait.hash(&mut hasher);
        self.dispatcher_max_in_flight.hash(&mut hasher);
        self.max_pub_acks_in_flight.hash(&mut hasher);
        self.filestore_dir.hash(&mut hasher);
        matches!(self.store_type, StoreType::File).hash(&mut hasher);
        self.nats_host.hash(&mut hasher);
        self.groundwork.host.hash(&mut hasher);
        self.groundwork.app_name.hash(&mut hasher);
        self.groundwork.user.hash(&mut hasher);
        self.groundwork.password.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher_ack_wait: Duration::from_secs(15),
            dispatcher_max_in_flight: 4,
            max_pub_acks_in_flight: 16,
            filestore_dir: PathBuf::from("./tcg-store"),
            store_type: StoreType::Memory,
            nats_host: "127.0.0.1:4222".to_string(),
            groundwork: GroundworkConnection {
                host: String::new(),
                app_name: String::new(),
                user: String::new(),
                password: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            groundwork: GroundworkConnection {
                host: "https://groundwork.example.com".into(),
                app_name: "tcg".into(),
                user: "agent".into(),
                password: "secret".into(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_suggested_values() {
        let cfg = Config::default();
        assert_eq!(cfg.dispatcher_ack_wait, Duration::from_secs(15));
        assert_eq!(cfg.dispatcher_max_in_flight, 4);
    }

    #[test]
    fn validate_rejects_zero_in_flight() {
        let mut cfg = valid_config();
        cfg.dispatcher_max_in_flight = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn validate_rejects_empty_host() {
        let mut cfg = valid_config();
        cfg.groundwork.host.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_filestore_dir_for_file_store() {
        let mut cfg = valid_config();
        cfg.store_type = StoreType::File;
        cfg.filestore_dir = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn checksum_is_stable_and_sensitive_to_change() {
        let a = valid_config();
        let b = valid_config();
        assert_eq!(a.checksum(), b.checksum());

        let mut c = valid_config();
        c.groundwork.app_name = "different".into();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn checksum_ignores_nothing_relevant_to_reload() {
        let mut a = valid_config();
        let mut b = valid_config();
        a.dispatcher_ack_wait = Duration::from_secs(30);
        b.dispatcher_ack_wait = Duration::from_secs(20);
        assert_ne!(a.checksum(), b.checksum());
    }
}
