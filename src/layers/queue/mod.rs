// src/layers/queue/mod.rs

//! Durable, sharded channel layer over Redis lists.
//!
//! Channels are Redis lists (`{prefix}:ch:{name}`, head = oldest); group
//! membership is a sorted set per group (`{prefix}:grp:{name}`, member =
//! channel name, score = added-at epoch seconds). Channel names are mapped
//! to one of the configured hosts by the stable hash in [`crate::shard`],
//! so every process routes a given channel to the same shard.
//!
//! Capacity checks and group fan-out run as server-side Lua scripts — one
//! atomic round trip per shard. Blocking pops run on dedicated pooled
//! connections so they never stall the command pipeline.
//!
//! Delivery contract: at-most-one receiver per message, per-channel FIFO
//! for a single producer, capacity refusal on the producer side.

mod layer;
mod pool;
mod scripts;

pub use layer::{QueueLayer, QueueLayerBuilder};
