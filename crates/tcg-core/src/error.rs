//! Error taxonomy for the transport subsystem
//!
//! A single tagged enum backs every fallible operation in this crate. The
//! dispatcher's failure classifier matches on the variant directly rather
//! than inspecting message text, so `is_retriable` is the one predicate it
//! needs.

use std::fmt;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport subsystem error taxonomy.
///
/// `Gateway` and `Synchronizer` are retriable; `Auth`, `Config` and
/// `Internal` are terminal. See [`Error::is_retriable`].
#[derive(Debug, Clone)]
pub enum Error {
    /// Downstream HTTP non-2xx response or transport failure from the
    /// Groundwork client. Retriable.
    Gateway {
        /// Human-readable detail, usually the response body or transport
        /// error message.
        message: String,
    },
    /// Synchronizer-specific protocol failure (4xx from the synchronizer
    /// path). Retriable.
    Synchronizer {
        /// Human-readable detail.
        message: String,
    },
    /// Token rejected after a single re-auth attempt. Terminal; the
    /// operator must fix credentials.
    Auth {
        /// Human-readable detail.
        message: String,
    },
    /// Malformed configuration. Terminal; never touches the data path.
    Config {
        /// Human-readable detail.
        message: String,
    },
    /// Programming error (cache type mismatch, invariant violation, etc).
    /// Terminal; logged, never retried.
    Internal {
        /// Human-readable detail.
        message: String,
    },
}

impl Error {
    /// Construct a [`Error::Gateway`].
    pub fn gateway(message: impl Into<String>) -> Self {
        Error::Gateway {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Synchronizer`].
    pub fn synchronizer(message: impl Into<String>) -> Self {
        Error::Synchronizer {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Auth`].
    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// The message carried by this error, regardless of variant.
    pub fn message(&self) -> &str {
        match self {
            Error::Gateway { message }
            | Error::Synchronizer { message }
            | Error::Auth { message }
            | Error::Config { message }
            | Error::Internal { message } => message,
        }
    }

    /// Whether the dispatcher should retry the worker that produced this
    /// error. Only `Gateway` and `Synchronizer` are retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Gateway { .. } | Error::Synchronizer { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Gateway { message } => write!(f, "gateway error: {message}"),
            Error::Synchronizer { message } => write!(f, "synchronizer error: {message}"),
            Error::Auth { message } => write!(f, "auth error: {message}"),
            Error::Config { message } => write!(f, "config error: {message}"),
            Error::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_and_synchronizer_are_retriable() {
        assert!(Error::gateway("boom").is_retriable());
        assert!(Error::synchronizer("bad request").is_retriable());
    }

    #[test]
    fn auth_config_internal_are_terminal() {
        assert!(!Error::auth("bad creds").is_retriable());
        assert!(!Error::config("missing field").is_retriable());
        assert!(!Error::internal("type assertion failed").is_retriable());
    }

    #[test]
    fn display_carries_the_message() {
        let err = Error::gateway("502 from upstream");
        assert!(err.to_string().contains("502 from upstream"));
        assert_eq!(err.message(), "502 from upstream");
    }
}
