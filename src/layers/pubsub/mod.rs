// src/layers/pubsub/mod.rs

//! Broadcast channel layer over Redis pub/sub.
//!
//! Fire-and-forget fan-out with no persistence: a message published while a
//! subscriber is disconnected is gone. The layer owns one shard per
//! configured host; each shard keeps a single long-lived subscriber
//! connection and demultiplexes incoming broadcasts into per-channel
//! bounded queues inside this process.
//!
//! ## Wire format
//!
//! - Per-channel publish: Redis channel `{prefix}:ch:{name}`, payload is
//!   the codec bytes (no message id).
//! - Group publish: Redis channel `{prefix}:__group__:{name}`, payload is
//!   the codec bytes of the message.
//!
//! Group membership never leaves the process: `group_send` publishes to the
//! reserved group channel on **every** shard, and each process that holds
//! local members fans out to them on arrival.
//!
//! ## Overflow
//!
//! When a local per-channel queue is full the **oldest** message is dropped
//! to make room. The consumer observes a gap but the shared subscriber
//! reader never stalls. This is the opposite of the queue backend's
//! refuse-on-full policy, and it is deliberate.

mod layer;
mod shard;

pub use layer::{PubSubLayer, PubSubLayerBuilder};
