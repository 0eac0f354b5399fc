//! Local proxy worker
//!
//! Holds an outbound channel open to the relay, registers a persistent
//! identity, and answers each `ai_request` by calling a locally hosted
//! OpenAI-compatible model. Never accepts inbound connections.

pub mod backend;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;

pub use client::{Disconnect, LocalProxy};
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use identity::WorkerIdentity;
