// src/layers/memory/layer.rs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{validate_channel_name, validate_group_name};
use crate::{log_debug, shard, ChannelLayer, Error, Message, Result};

/// Configuration for [`InMemoryLayer`].
#[derive(Clone, Debug)]
pub struct InMemoryLayerConfig {
    /// Maximum unconsumed messages per channel.
    pub capacity: usize,
    /// How long an unconsumed message stays deliverable.
    pub expiry: Duration,
    /// How long a group membership stays live without a refresh.
    pub group_expiry: Duration,
}

impl Default for InMemoryLayerConfig {
    fn default() -> Self {
        // ---
        Self {
            capacity: 100,
            expiry: Duration::from_secs(60),
            group_expiry: Duration::from_secs(86_400),
        }
    }
}

/// One channel's queue: deadline-stamped messages plus a waiter wakeup.
struct ChannelQueue {
    queue: VecDeque<(Instant, Message)>,
    notify: Arc<Notify>,
}

impl ChannelQueue {
    // ---

    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Discard messages whose deadline has passed.
    fn drop_expired(&mut self, now: Instant) {
        // ---
        while self
            .queue
            .front()
            .is_some_and(|(deadline, _)| *deadline <= now)
        {
            self.queue.pop_front();
        }
    }
}

/// In-process channel layer.
///
/// All state lives in one address space behind cooperative locks: a bounded
/// FIFO per channel and an added-at timestamp per group member. See the
/// module docs for the semantics this layer pins down.
pub struct InMemoryLayer {
    config: InMemoryLayerConfig,
    channels: Mutex<HashMap<String, ChannelQueue>>,
    groups: Mutex<HashMap<String, HashMap<String, Instant>>>,
    closed: AtomicBool,
}

impl InMemoryLayer {
    // ---

    /// Create a layer with the given configuration.
    pub fn new(config: InMemoryLayerConfig) -> Self {
        // ---
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::LayerClosed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryLayer {
    fn default() -> Self {
        Self::new(InMemoryLayerConfig::default())
    }
}

#[async_trait::async_trait]
impl ChannelLayer for InMemoryLayer {
    // ---

    async fn send(&self, channel: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_channel_name(channel)?;
        message.validate()?;

        let mut channels = self.channels.lock().await;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new);

        let now = Instant::now();
        entry.drop_expired(now);

        if entry.queue.len() >= self.config.capacity {
            return Err(Error::ChannelFull {
                channel: channel.to_string(),
            });
        }

        entry.queue.push_back((now + self.config.expiry, message));
        entry.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, channel: &str) -> Result<Message> {
        // ---
        validate_channel_name(channel)?;

        loop {
            self.ensure_open()?;

            let notify = {
                let mut channels = self.channels.lock().await;
                let entry = channels
                    .entry(channel.to_string())
                    .or_insert_with(ChannelQueue::new);
                entry.drop_expired(Instant::now());
                if let Some((_, message)) = entry.queue.pop_front() {
                    return Ok(message);
                }
                Arc::clone(&entry.notify)
            };

            // Arm the waiter before re-checking so a send between the two
            // lock scopes cannot be missed; `close()` only wakes waiters
            // that are already armed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut channels = self.channels.lock().await;
                if let Some(entry) = channels.get_mut(channel) {
                    entry.drop_expired(Instant::now());
                    if let Some((_, message)) = entry.queue.pop_front() {
                        return Ok(message);
                    }
                }
                if self.closed.load(Ordering::SeqCst) {
                    return Err(Error::LayerClosed);
                }
            }

            notified.await;
        }
    }

    async fn new_channel(&self, prefix: &str) -> Result<String> {
        // ---
        self.ensure_open()?;
        let name = format!("{prefix}.{}", shard::random_token());
        validate_channel_name(&name)?;
        Ok(name)
    }

    async fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        validate_channel_name(channel)?;

        self.groups
            .lock()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string(), Instant::now());
        Ok(())
    }

    async fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        validate_channel_name(channel)?;

        let mut groups = self.groups.lock().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(channel);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        Ok(())
    }

    async fn group_send(&self, group: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        message.validate()?;

        let members: Vec<String> = {
            let mut groups = self.groups.lock().await;
            let Some(members) = groups.get_mut(group) else {
                return Ok(());
            };

            let now = Instant::now();
            let horizon = self.config.group_expiry;
            members.retain(|_, added| now.duration_since(*added) < horizon);

            if members.is_empty() {
                groups.remove(group);
                return Ok(());
            }
            members.keys().cloned().collect()
        };

        for member in members {
            match self.send(&member, message.clone()).await {
                Ok(()) => {}
                Err(Error::ChannelFull { channel: _full }) => {
                    log_debug!("group {group}: dropping broadcast, channel {_full} full");
                }
                Err(_err) => {
                    log_debug!("group {group}: broadcast to one member failed: {_err}");
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // ---
        // Queue entries are kept (their wakeups stay armed for blocked
        // receivers); only the content is dropped.
        let mut channels = self.channels.lock().await;
        for entry in channels.values_mut() {
            entry.queue.clear();
        }
        self.groups.lock().await.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);

        let mut channels = self.channels.lock().await;
        for entry in channels.values() {
            entry.notify.notify_waiters();
        }
        channels.clear();
        self.groups.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn small_layer() -> InMemoryLayer {
        // ---
        InMemoryLayer::new(InMemoryLayerConfig {
            capacity: 3,
            expiry: Duration::from_millis(50),
            ..InMemoryLayerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_expired_messages_are_skipped() {
        // ---
        tokio::time::pause();

        let layer = small_layer();
        layer.send("a", Message::new("t").with("i", 1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        layer.send("a", Message::new("t").with("i", 2)).await.unwrap();

        let got = layer.receive("a").await.unwrap();
        assert_eq!(got.get("i").and_then(crate::Value::as_i64), Some(2));
    }

    #[tokio::test]
    async fn test_expired_messages_free_capacity() {
        // ---
        tokio::time::pause();

        let layer = small_layer();
        for i in 0..3 {
            layer.send("a", Message::new("t").with("i", i)).await.unwrap();
        }
        assert!(matches!(
            layer.send("a", Message::new("t")).await,
            Err(Error::ChannelFull { .. })
        ));

        tokio::time::advance(Duration::from_millis(60)).await;
        layer.send("a", Message::new("t").with("i", 9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_membership_expires() {
        // ---
        tokio::time::pause();

        let layer = InMemoryLayer::new(InMemoryLayerConfig {
            group_expiry: Duration::from_millis(100),
            ..InMemoryLayerConfig::default()
        });

        layer.group_add("g", "a").await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        layer.group_send("g", Message::new("t")).await.unwrap();

        // The stale member saw nothing.
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), layer.receive("a")).await;
        assert!(timed_out.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        // ---
        let layer = Arc::new(InMemoryLayer::default());

        let waiter = {
            let layer = Arc::clone(&layer);
            tokio::spawn(async move { layer.receive("idle").await })
        };
        tokio::task::yield_now().await;

        layer.close().await.unwrap();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(Error::LayerClosed)));

        assert!(matches!(
            layer.send("idle", Message::new("t")).await,
            Err(Error::LayerClosed)
        ));
    }
}
