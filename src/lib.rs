//! # tcg-agent
//!
//! Thin top-level crate re-exporting [`tcg_core`], the transport subsystem
//! (durable broker, dispatcher, Groundwork HTTP client, cache, agent
//! service) that an outer process wires up to a control-plane HTTP layer
//! and a concrete configuration source.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub use tcg_core::*;
