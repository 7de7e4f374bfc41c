//! `tracing` initialization.
//!
//! A small builder that installs a global `tracing` subscriber. This
//! crate's logging contract stops at emitting structured `tracing` events;
//! where those events end up (stdout, a collector, a log shipper) is left
//! to the host process.

use std::env;

use tracing_subscriber::EnvFilter;

/// Builder for the process-wide `tracing` subscriber.
pub struct TelemetryBuilder {
    service_name: String,
    json: bool,
    log_level: String,
}

impl TelemetryBuilder {
    /// Start a builder for `service_name` (recorded as the `service` field
    /// on every event via a default span, see [`TelemetryBuilder::init`]).
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            json: false,
            log_level: "info".to_string(),
        }
    }

    /// Emit JSON-formatted log lines instead of the default human-readable
    /// format.
    pub fn json_logging(mut self) -> Self {
        self.json = true;
        self
    }

    /// Set the default log level, overridden by `RUST_LOG` if set.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Read the log level from `RUST_LOG`, if present.
    pub fn log_level_from_env(mut self) -> Self {
        if let Ok(level) = env::var("RUST_LOG") {
            self.log_level = level;
        }
        self
    }

    /// Install the subscriber as the global default. Must be called at most
    /// once per process.
    pub fn init(self) {
        let env_filter =
            EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let service_name = self.service_name;
        if self.json {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_env_filter(env_filter)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(env_filter)
                .init();
        }
        tracing::info!(service = %service_name, "tracing initialized");
    }
}

/// Shorthand for `TelemetryBuilder::new(service_name).log_level_from_env().init()`.
pub fn init_tracing(service_name: impl Into<String>) {
    TelemetryBuilder::new(service_name).log_level_from_env().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_info_and_plain_text() {
        let builder = TelemetryBuilder::new("tcg-agent");
        assert_eq!(builder.log_level, "info");
        assert!(!builder.json);
    }

    #[test]
    fn json_logging_sets_the_flag() {
        let builder = TelemetryBuilder::new("tcg-agent").json_logging();
        assert!(builder.json);
    }
}
