// src/layers/memory/mod.rs

//! In-process channel layer.
//!
//! This module provides a pure in-process implementation of the
//! domain-level `ChannelLayer` trait. It is intended for testing, local
//! execution, and as the reference for layer semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory layer defines the **reference behavior** for the channel
//! layer. The store-backed layers are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! In particular, the in-memory layer establishes the following expectations:
//!
//! - Per-channel FIFO: a single producer's messages arrive in send order.
//! - A send that would exceed the channel capacity fails with `ChannelFull`;
//!   nothing is silently dropped on the producer side.
//! - Message and group-membership expiry is lazy — stale entries are
//!   discarded when next touched, never by a background sweeper.
//!
//! ## Non-Goals
//!
//! No persistence, no cross-process delivery, no failure simulation. State
//! lives and dies with the owning process.

mod layer;

pub use layer::{InMemoryLayer, InMemoryLayerConfig};
