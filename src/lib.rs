//! Channel-layer backends for real-time message routing.
//!
//! This library provides a message-routing substrate for ASGI-style
//! real-time applications: independent processes, background workers, and
//! in-process consumers exchange structured events through named
//! point-to-point channels and named broadcast groups. Three
//! interchangeable backends implement the same [`ChannelLayer`] capability:
//!
//! | Layer             | Delivery                               | Scope         |
//! |:------------------|:---------------------------------------|:--------------|
//! | [`InMemoryLayer`] | Bounded FIFO queues, lazy expiry       | One process   |
//! | [`QueueLayer`]    | Redis lists, at-most-one receiver      | Cross-process |
//! | [`PubSubLayer`]   | Redis pub/sub, one copy per subscriber | Cross-process |
//!
//! The Redis layers shard across any number of hosts; a stable hash over
//! the channel name (or its `!` suffix, for consumer-owned ephemeral
//! channels) picks the shard, so every process routes a name to the same
//! backend instance.
//!
//! **Note:** The `logging` feature (enabled by default) provides diagnostic
//! output via `tracing`. To disable logging, use `default-features = false`
//! in your `Cargo.toml`.
//!
//! # Quick Start
//!
//! ```
//! use channel_layers::{ChannelLayer, InMemoryLayer, Message};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> channel_layers::Result<()> {
//!     //
//!     let layer = InMemoryLayer::default();
//!
//!     layer.group_add("room", "alice").await?;
//!     layer.group_add("room", "bob").await?;
//!
//!     layer
//!         .group_send("room", Message::new("chat.message").with("body", "hi"))
//!         .await?;
//!
//!     let seen = layer.receive("bob").await?;
//!     assert_eq!(seen.msg_type(), Some("chat.message"));
//!     Ok(())
//! }
//! ```
//!
//! Cross-process delivery works the same way through [`QueueLayer`] or
//! [`PubSubLayer`], built with their builders against one or more Redis
//! hosts.

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::panic_in_result_fn
    )
)]

////////////////////////////////////////
// Submodules
////////////////////////////////////////

mod codec;
mod domain;
mod error;
mod layers;
mod registry;

pub mod shard;

mod macros;

////////////////////////////////////////
// Public API
////////////////////////////////////////

pub use error::{Error, Result};

pub use domain::{ChannelLayer, LayerPtr, Message, Value, DEFAULT_CHANNEL_PREFIX};

pub use codec::{Codec, CodecPtr, JsonCodec, MsgPackCodec};

#[cfg(feature = "encryption")]
pub use codec::EncryptedCodec;

pub use layers::{
    // ---
    InMemoryLayer,
    InMemoryLayerConfig,
    PubSubLayer,
    PubSubLayerBuilder,
    QueueLayer,
    QueueLayerBuilder,
};

pub use registry::LayerRegistry;

////////////////////////////////////////
// Internal helpers
////////////////////////////////////////

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};
