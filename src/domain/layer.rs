// src/domain/layer.rs

//! The channel-layer capability.

use std::sync::Arc;

use crate::{Message, Result};

/// Default prefix for ephemeral channel names created by
/// [`ChannelLayer::new_channel`].
pub const DEFAULT_CHANNEL_PREFIX: &str = "specific";

/// Channel-layer abstraction.
///
/// A `ChannelLayer` routes structured messages between independent producers
/// and consumers through named point-to-point channels and named broadcast
/// groups. It defines the minimal contract required by consumer frameworks
/// without committing to any specific store.
///
/// Implementations must ensure that:
/// - For a single producer sending to a single channel, delivery order is
///   the send order.
/// - `receive()` returns a whole message or does not return for that call.
/// - `group_send()` is best-effort: per-member failures are swallowed, never
///   surfaced to the caller.
/// - All operations are cancellable at every suspension point without
///   leaking connections or corrupting queue state.
///
/// The in-memory layer serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show
/// explicit lifetimes and a boxed `Future`. This is an implementation
/// detail — consumers should treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Send a message to a channel.
    ///
    /// # Errors
    ///
    /// `ChannelFull` if the channel is at capacity, `InvalidChannelName` /
    /// `InvalidMessage` on malformed input, `LayerClosed` after `close()`,
    /// `BackendUnavailable` on transient store failure.
    async fn send(&self, channel: &str, message: Message) -> Result<()>;

    /// Receive the next message from a channel.
    ///
    /// Blocks until a message is available or the caller cancels. The call
    /// itself imposes no timeout; callers wrap it if they need one.
    async fn receive(&self, channel: &str) -> Result<Message>;

    /// Create a unique ephemeral channel name with the given prefix.
    ///
    /// Most callers pass [`DEFAULT_CHANNEL_PREFIX`].
    async fn new_channel(&self, prefix: &str) -> Result<String>;

    /// Add a channel to a group. Re-adding refreshes the membership.
    async fn group_add(&self, group: &str, channel: &str) -> Result<()>;

    /// Remove a channel from a group.
    async fn group_discard(&self, group: &str, channel: &str) -> Result<()>;

    /// Broadcast a message to every live member of a group.
    ///
    /// Best-effort: members at capacity are skipped silently.
    async fn group_send(&self, group: &str, message: Message) -> Result<()>;

    /// Discard all queued messages and group state owned by this layer.
    async fn flush(&self) -> Result<()>;

    /// Shut the layer down.
    ///
    /// Drops subscriptions, closes connections, and wakes pending receivers.
    /// Subsequent operations fail with `LayerClosed`.
    async fn close(&self) -> Result<()>;
}

/// Shared layer pointer.
///
/// An `Arc<dyn ChannelLayer>`: `.clone()` is cheap and all clones share the
/// same backend state. Used to erase concrete layer types behind a stable
/// domain interface.
pub type LayerPtr = Arc<dyn ChannelLayer>;
