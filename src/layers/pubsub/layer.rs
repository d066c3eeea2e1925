// src/layers/pubsub/layer.rs

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::codec::{CodecPtr, MsgPackCodec};
use crate::domain::{validate_channel_name, validate_group_name};
use crate::layers::ConnectTarget;
use crate::{log_warn, shard, ChannelLayer, Error, Message, Result};

use super::shard::{LifecycleHooks, PubSubShard};

/// Broadcast channel layer over Redis pub/sub. See the module docs for the
/// delivery contract; construct through [`PubSubLayerBuilder`].
pub struct PubSubLayer {
    shards: Vec<Arc<PubSubShard>>,
    codec: CodecPtr,
    next_shard: AtomicUsize,
    closed: AtomicBool,
}

impl PubSubLayer {
    // ---

    /// Start building a layer.
    pub fn builder() -> PubSubLayerBuilder {
        PubSubLayerBuilder::new()
    }

    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::LayerClosed)
        } else {
            Ok(())
        }
    }

    fn shard_for(&self, channel: &str) -> &Arc<PubSubShard> {
        &self.shards[shard::shard_index(channel, self.shards.len())]
    }

    /// Release a channel this consumer no longer owns.
    ///
    /// Closes the local queue (waking any blocked `receive`), removes the
    /// channel from every local group, and drops the now-unreferenced
    /// subscriptions. Not part of the layer capability — consumer
    /// frameworks call this when a consumer instance is torn down.
    pub async fn release_channel(&self, channel: &str) -> Result<()> {
        // ---
        validate_channel_name(channel)?;
        self.shard_for(channel).release_channel(channel).await
    }

    /// How many messages have been dropped from a channel's local queue to
    /// make room for newer ones. `None` if the channel is not hosted here.
    pub async fn channel_overflow(&self, channel: &str) -> Option<u64> {
        self.shard_for(channel).channel_overflow(channel).await
    }
}

#[async_trait::async_trait]
impl ChannelLayer for PubSubLayer {
    // ---

    async fn send(&self, channel: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_channel_name(channel)?;
        message.validate()?;

        let shard = self.shard_for(channel);

        // Fast local path: a channel hosted by this very instance skips the
        // broker round trip entirely.
        let message = match shard.deliver_local(channel, message).await {
            None => return Ok(()),
            Some(message) => message,
        };

        let payload = self.codec.encode(&message)?.to_vec();
        shard.publish_channel(channel, payload).await
    }

    async fn receive(&self, channel: &str) -> Result<Message> {
        // ---
        self.ensure_open()?;
        validate_channel_name(channel)?;

        let queue = self.shard_for(channel).ensure_channel(channel).await?;
        queue.pop().await.ok_or(Error::LayerClosed)
    }

    async fn new_channel(&self, prefix: &str) -> Result<String> {
        // ---
        self.ensure_open()?;

        let shard_count = self.shards.len();
        let shard_idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % shard_count;
        let suffix = shard::suffix_for_shard(shard_idx, shard_count)?;

        let name = format!("{prefix}.{}!{suffix}", shard::random_token());
        validate_channel_name(&name)?;
        Ok(name)
    }

    async fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        validate_channel_name(channel)?;

        self.shard_for(channel).group_join(group, channel).await
    }

    async fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        validate_channel_name(channel)?;

        self.shard_for(channel).group_leave(group, channel).await
    }

    async fn group_send(&self, group: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        message.validate()?;

        let payload = self.codec.encode(&message)?.to_vec();

        // Every shard gets the broadcast: any process holding members may
        // be subscribed on any of them.
        let publishes = self.shards.iter().map(|shard| {
            let payload = payload.clone();
            async move { shard.publish_group(group, payload).await }
        });

        let mut failures = 0;
        let mut last_err = None;
        for outcome in join_all(publishes).await {
            if let Err(err) = outcome {
                failures += 1;
                last_err = Some(err);
            }
        }

        if failures > 0 {
            log_warn!("group {group}: publish failed on {failures} shard(s)");
        }
        match last_err {
            Some(err) if failures == self.shards.len() => Err(err),
            _ => Ok(()),
        }
    }

    async fn flush(&self) -> Result<()> {
        // ---
        for shard in &self.shards {
            shard.flush_local().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        for shard in &self.shards {
            shard.shutdown().await;
        }
        Ok(())
    }
}

/// Builder for [`PubSubLayer`].
///
/// # Examples
///
/// ```no_run
/// use channel_layers::PubSubLayer;
///
/// # fn example() -> channel_layers::Result<()> {
/// let layer = PubSubLayer::builder()
///     .host("redis://127.0.0.1:6379")
///     .prefix("app")
///     .on_disconnect(|| eprintln!("pubsub gap started"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PubSubLayerBuilder {
    targets: Vec<ConnectTarget>,
    prefix: String,
    capacity: usize,
    codec: Option<CodecPtr>,
    hooks: LifecycleHooks,
}

impl PubSubLayerBuilder {
    // ---

    /// Create a builder with the default capacity (100) and key prefix
    /// (`"channels"`).
    pub fn new() -> Self {
        // ---
        Self {
            targets: Vec::new(),
            prefix: "channels".to_string(),
            capacity: 100,
            codec: None,
            hooks: LifecycleHooks::default(),
        }
    }

    /// Add one directly-addressed shard.
    pub fn host(mut self, url: impl Into<String>) -> Self {
        // ---
        self.targets.push(ConnectTarget::Direct { url: url.into() });
        self
    }

    /// Add several directly-addressed shards, in order.
    pub fn hosts<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        for url in urls {
            self = self.host(url);
        }
        self
    }

    /// Add a shard whose primary is resolved through sentinel discovery.
    pub fn sentinel<I, S>(mut self, sentinel_urls: I, service_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        self.targets.push(ConnectTarget::Sentinel {
            urls: sentinel_urls.into_iter().map(Into::into).collect(),
            service_name: service_name.into(),
        });
        self
    }

    /// Wire-name namespace for channel and group publishes.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Capacity of each local per-channel queue (drop-oldest beyond it).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the default MessagePack codec.
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Called when a shard's subscriber connection drops.
    pub fn on_disconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Called when a shard's subscriber connection is re-established and
    /// its subscriptions have been replayed.
    pub fn on_reconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_reconnect = Some(Arc::new(hook));
        self
    }

    /// Build the layer (consumes self). Shard connections are opened lazily
    /// on first use, so this never touches the network.
    ///
    /// # Errors
    ///
    /// `Configuration` if no shard was added, the prefix is empty, or the
    /// capacity is zero.
    pub fn build(self) -> Result<PubSubLayer> {
        // ---
        if self.targets.is_empty() {
            return Err(Error::Configuration(
                "at least one host or sentinel shard is required".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(Error::Configuration("prefix must not be empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(Error::Configuration(
                "capacity must be at least one".to_string(),
            ));
        }

        let codec = self.codec.unwrap_or_else(|| Arc::new(MsgPackCodec));

        Ok(PubSubLayer {
            shards: self
                .targets
                .into_iter()
                .map(|target| {
                    PubSubShard::new(
                        target,
                        self.prefix.clone(),
                        self.capacity,
                        Arc::clone(&codec),
                        self.hooks.clone(),
                    )
                })
                .collect(),
            codec,
            next_shard: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for PubSubLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_builder_requires_a_shard() {
        // ---
        assert!(matches!(
            PubSubLayer::builder().build(),
            Err(Error::Configuration(_))
        ));
        assert!(PubSubLayer::builder()
            .host("redis://localhost")
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_new_channel_round_robins_shards() {
        // ---
        let layer = PubSubLayer::builder()
            .hosts(["redis://a", "redis://b"])
            .build()
            .unwrap();

        let shards: std::collections::HashSet<usize> = {
            let mut out = std::collections::HashSet::new();
            for _ in 0..4 {
                let name = layer.new_channel("specific").await.unwrap();
                out.insert(shard::shard_index(&name, 2));
            }
            out
        };
        assert_eq!(shards.len(), 2);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        // ---
        let layer = PubSubLayer::builder().host("redis://localhost").build().unwrap();
        layer.close().await.unwrap();

        assert!(matches!(
            layer.send("a", Message::new("t")).await,
            Err(Error::LayerClosed)
        ));
        assert!(matches!(
            layer.new_channel("specific").await,
            Err(Error::LayerClosed)
        ));
    }
}
