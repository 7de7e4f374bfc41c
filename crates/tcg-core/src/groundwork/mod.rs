//! HTTP client mediating all traffic to the downstream Groundwork API.

mod client;

pub use client::{AuthFlow, GroundworkClient, ValidateTokenResult};
