// src/layers/mod.rs

//! Channel-layer backends.
//!
//! This module provides the concrete implementations of the domain-level
//! `ChannelLayer` trait. Domain code must not depend on backend-specific
//! types.

mod connect;
mod memory;
mod pubsub;
mod queue;

pub use memory::{InMemoryLayer, InMemoryLayerConfig};
pub use pubsub::{PubSubLayer, PubSubLayerBuilder};
pub use queue::{QueueLayer, QueueLayerBuilder};

pub(crate) use connect::{backend_err, epoch_secs, ConnectTarget, ReconnectBackoff};
