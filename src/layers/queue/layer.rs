// src/layers/queue/layer.rs

//! The durable queue layer and its builder.
//!
//! ## Concurrency model
//!
//! Regular commands run on pooled multiplexed connections, acquired per
//! operation and returned when the operation completes. Blocking pops are
//! different: a `BLPOP` ties up its connection server-side, so each
//! `receive()` hands a dedicated pooled connection to a short-lived worker
//! task and awaits the result through a oneshot.
//!
//! ## Cancellation
//!
//! `receive()` is cancellable at any point. The chosen policy is
//! **requeue at head**: if the caller disappears after the worker has
//! already popped an entry, the raw entry is `LPUSH`ed back so queue
//! contents and FIFO order are preserved. Both half-windows are covered —
//! the worker requeues when its oneshot send fails, and the caller-side
//! guard requeues an entry that was handed over but never read.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::oneshot;

use crate::codec::{CodecPtr, MsgPackCodec};
use crate::domain::{validate_channel_name, validate_group_name};
use crate::layers::{backend_err, epoch_secs, ConnectTarget};
use crate::{log_debug, log_warn, shard, ChannelLayer, Error, Message, Result};

use super::pool::ShardPool;
use super::scripts;

/// Random message-id bytes prefixed to every queue entry.
const MESSAGE_ID_LEN: usize = 12;

/// Server-side `BLPOP` timeout; bounds how long a cancelled receive can
/// keep its worker alive.
const BLPOP_TIMEOUT_SECS: usize = 2;

/// Durable, sharded channel layer. See the module docs for the wire and
/// concurrency contracts; construct through [`QueueLayerBuilder`].
pub struct QueueLayer {
    prefix: String,
    capacity: usize,
    expiry_secs: u64,
    group_expiry_secs: u64,
    codec: CodecPtr,
    shards: Vec<Arc<ShardPool>>,
    send_script: Script,
    group_send_script: Script,
    next_shard: AtomicUsize,
    closed: AtomicBool,
}

impl QueueLayer {
    // ---

    /// Start building a layer.
    pub fn builder() -> QueueLayerBuilder {
        QueueLayerBuilder::new()
    }

    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::LayerClosed)
        } else {
            Ok(())
        }
    }

    fn pool_for(&self, channel: &str) -> Arc<ShardPool> {
        Arc::clone(&self.shards[shard::shard_index(channel, self.shards.len())])
    }

    fn channel_key(&self, name: &str) -> String {
        format!("{}:ch:{name}", self.prefix)
    }

    fn channel_key_prefix(&self) -> String {
        format!("{}:ch:", self.prefix)
    }

    fn group_key(&self, name: &str) -> String {
        format!("{}:grp:{name}", self.prefix)
    }

    /// Encode a message and prepend a fresh random message id.
    fn wire_payload(&self, message: &Message) -> Result<Vec<u8>> {
        // ---
        let encoded = self.codec.encode(message)?;
        let id = uuid::Uuid::new_v4();
        let mut payload = Vec::with_capacity(MESSAGE_ID_LEN + encoded.len());
        payload.extend_from_slice(&id.as_bytes()[..MESSAGE_ID_LEN]);
        payload.extend_from_slice(&encoded);
        Ok(payload)
    }

    /// Strip the message id and decode.
    fn decode_entry(&self, raw: &[u8]) -> Result<Message> {
        // ---
        if raw.len() < MESSAGE_ID_LEN {
            return Err(Error::Serialization(
                "queue entry shorter than its message id".to_string(),
            ));
        }
        self.codec.decode(&raw[MESSAGE_ID_LEN..])
    }
}

#[async_trait::async_trait]
impl ChannelLayer for QueueLayer {
    // ---

    async fn send(&self, channel: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_channel_name(channel)?;
        message.validate()?;

        let payload = self.wire_payload(&message)?;
        let key = self.channel_key(channel);
        let pool = self.pool_for(channel);

        let mut conn = pool.acquire().await?;
        let pushed: std::result::Result<i64, redis::RedisError> = self
            .send_script
            .key(&key)
            .arg(self.capacity)
            .arg(self.expiry_secs)
            .arg(&payload)
            .invoke_async::<i64>(&mut conn)
            .await;

        match pushed {
            Ok(1) => {
                pool.release(conn).await;
                Ok(())
            }
            Ok(_) => {
                pool.release(conn).await;
                Err(Error::ChannelFull {
                    channel: channel.to_string(),
                })
            }
            Err(err) => Err(backend_err("send", err)),
        }
    }

    async fn receive(&self, channel: &str) -> Result<Message> {
        // ---
        self.ensure_open()?;
        validate_channel_name(channel)?;

        let key = self.channel_key(channel);
        let pool = self.pool_for(channel);
        let conn = pool.acquire().await?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(blpop_worker(Arc::clone(&pool), conn, key.clone(), tx));

        let mut guard = PopGuard {
            rx: Some(rx),
            pool,
            key,
        };
        let raw = guard.recv().await?;
        self.decode_entry(&raw)
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

        // Membership lives on the member channel's shard, next to the list
        // it will be fanned out to.
        let key = self.group_key(group);
        let pool = self.pool_for(channel);

        let mut conn = pool.acquire().await?;
        let added: std::result::Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(epoch_secs())
            .arg(channel)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.group_expiry_secs)
            .ignore()
            .query_async(&mut conn)
            .await;

        match added {
            Ok(()) => {
                pool.release(conn).await;
                Ok(())
            }
            Err(err) => Err(backend_err("group_add", err)),
        }
    }

    async fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        validate_channel_name(channel)?;

        let key = self.group_key(group);
        let pool = self.pool_for(channel);

        let mut conn = pool.acquire().await?;
        let removed: std::result::Result<i64, redis::RedisError> = redis::cmd("ZREM")
            .arg(&key)
            .arg(channel)
            .query_async(&mut conn)
            .await;

        match removed {
            Ok(_) => {
                pool.release(conn).await;
                Ok(())
            }
            Err(err) => Err(backend_err("group_discard", err)),
        }
    }

    async fn group_send(&self, group: &str, message: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        validate_group_name(group)?;
        message.validate()?;

        let payload = self.wire_payload(&message)?;
        let key = self.group_key(group);
        let key_prefix = self.channel_key_prefix();
        let horizon = epoch_secs() - self.group_expiry_secs as f64;

        // One atomic script per shard, all in flight at once. Each shard's
        // sorted set holds exactly the members homed there.
        let rounds = self.shards.iter().map(|pool| {
            let pool = Arc::clone(pool);
            let key = key.clone();
            let key_prefix = key_prefix.clone();
            let payload = payload.clone();
            async move {
                let mut conn = pool.acquire().await?;
                let counts: std::result::Result<Vec<i64>, redis::RedisError> = self
                    .group_send_script
                    .key(&key)
                    .arg(horizon)
                    .arg(self.capacity)
                    .arg(self.expiry_secs)
                    .arg(&key_prefix)
                    .arg(&payload)
                    .invoke_async::<Vec<i64>>(&mut conn)
                    .await;
                match counts {
                    Ok(counts) => {
                        pool.release(conn).await;
                        Ok((
                            counts.first().copied().unwrap_or(0),
                            counts.get(1).copied().unwrap_or(0),
                        ))
                    }
                    Err(err) => Err(backend_err("group_send", err)),
                }
            }
        });

        let mut delivered = 0;
        let mut skipped = 0;
        let mut last_err = None;
        let mut failures = 0;

        for outcome in join_all(rounds).await {
            match outcome {
                Ok((d, s)) => {
                    delivered += d;
                    skipped += s;
                }
                Err(err) => {
                    failures += 1;
                    last_err = Some(err);
                }
            }
        }

        if skipped > 0 {
            log_debug!("group {group}: {skipped} members at capacity, dropped");
        }
        if failures > 0 {
            log_warn!("group {group}: fan-out failed on {failures} shard(s)");
        }

        // Broadcast is best-effort per member; only a total outage is an
        // error the caller can act on.
        match last_err {
            Some(err) if failures == self.shards.len() => Err(err),
            _ => {
                log_debug!("group {group}: delivered to {delivered} members");
                Ok(())
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        // ---
        let pattern = format!("{}:*", self.prefix);

        for pool in &self.shards {
            let mut conn = pool.acquire().await?;
            let mut cursor: u64 = 0;

            loop {
                let scanned: std::result::Result<(u64, Vec<String>), redis::RedisError> =
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await;

                let (next, keys) = match scanned {
                    Ok(page) => page,
                    Err(err) => return Err(backend_err("flush", err)),
                };

                if !keys.is_empty() {
                    let deleted: std::result::Result<i64, redis::RedisError> =
                        redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
                    if let Err(err) = deleted {
                        return Err(backend_err("flush", err));
                    }
                }

                cursor = next;
                if cursor == 0 {
                    break;
                }
            }

            pool.release(conn).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        for pool in &self.shards {
            pool.clear().await;
        }
        Ok(())
    }
}

/// Owns one pooled connection for the lifetime of a blocking pop.
async fn blpop_worker(
    pool: Arc<ShardPool>,
    mut conn: MultiplexedConnection,
    key: String,
    tx: oneshot::Sender<Result<Vec<u8>>>,
) {
    // ---
    let outcome = loop {
        if tx.is_closed() {
            break None;
        }

        let popped: std::result::Result<Option<(String, Vec<u8>)>, redis::RedisError> =
            redis::cmd("BLPOP")
                .arg(&key)
                .arg(BLPOP_TIMEOUT_SECS)
                .query_async(&mut conn)
                .await;

        match popped {
            Ok(Some((_list, raw))) => break Some(Ok(raw)),
            Ok(None) => continue,
            Err(err) => break Some(Err(backend_err("receive", err))),
        }
    };

    match outcome {
        None => pool.release(conn).await,
        Some(Err(err)) => {
            // Connection state is suspect after an error; retire it.
            let _ = tx.send(Err(err));
        }
        Some(Ok(raw)) => match tx.send(Ok(raw)) {
            Ok(()) => pool.release(conn).await,
            Err(returned) => {
                if let Ok(raw) = returned {
                    requeue_head(&pool, &mut conn, &key, &raw).await;
                }
            }
        },
    }
}

/// Push a raw entry back to the head of its list after a cancelled pop.
async fn requeue_head(
    pool: &Arc<ShardPool>,
    conn: &mut MultiplexedConnection,
    key: &str,
    raw: &[u8],
) {
    // ---
    let requeued: std::result::Result<i64, redis::RedisError> = redis::cmd("LPUSH")
        .arg(key)
        .arg(raw)
        .query_async(conn)
        .await;

    match requeued {
        Ok(_) => pool.release(conn.clone()).await,
        Err(_err) => {
            log_warn!("requeue after cancelled receive failed on {key}: {_err}");
        }
    }
}

/// Caller-side half of the cancellation contract: recovers an entry that
/// the worker handed over but the (cancelled) caller never read.
struct PopGuard {
    rx: Option<oneshot::Receiver<Result<Vec<u8>>>>,
    pool: Arc<ShardPool>,
    key: String,
}

impl PopGuard {
    // ---

    async fn recv(&mut self) -> Result<Vec<u8>> {
        // ---
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(Error::Internal("pop guard polled twice".to_string())),
        };
        self.rx = None;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Internal("receive worker vanished".to_string())),
        }
    }
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        // ---
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        if let Ok(Ok(raw)) = rx.try_recv() {
            let pool = Arc::clone(&self.pool);
            let key = self.key.clone();
            tokio::spawn(async move {
                match pool.acquire().await {
                    Ok(mut conn) => requeue_head(&pool, &mut conn, &key, &raw).await,
                    Err(_err) => {
                        log_warn!("requeue after cancelled receive failed on {key}: {_err}");
                    }
                }
            });
        }
    }
}

/// Builder for [`QueueLayer`].
///
/// # Examples
///
/// ```no_run
/// use channel_layers::QueueLayer;
///
/// # fn example() -> channel_layers::Result<()> {
/// let layer = QueueLayer::builder()
///     .host("redis://127.0.0.1:6379")
///     .host("redis://127.0.0.1:6380")
///     .prefix("app")
///     .capacity(200)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct QueueLayerBuilder {
    targets: Vec<ConnectTarget>,
    prefix: String,
    capacity: usize,
    expiry_secs: u64,
    group_expiry_secs: u64,
    codec: Option<CodecPtr>,
    #[cfg(feature = "encryption")]
    encryption_keys: Vec<Vec<u8>>,
}

impl QueueLayerBuilder {
    // ---

    /// Create a builder with the default capacity (100), message expiry
    /// (60 s), group expiry (86 400 s), and key prefix (`"channels"`).
    pub fn new() -> Self {
        // ---
        Self {
            targets: Vec::new(),
            prefix: "channels".to_string(),
            capacity: 100,
            expiry_secs: 60,
            group_expiry_secs: 86_400,
            codec: None,
            #[cfg(feature = "encryption")]
            encryption_keys: Vec::new(),
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

    /// Key namespace; all keys are written as `{prefix}:ch:{..}` /
    /// `{prefix}:grp:{..}`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Maximum unconsumed messages per channel.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Seconds an unconsumed message stays deliverable.
    pub fn expiry(mut self, secs: u64) -> Self {
        self.expiry_secs = secs;
        self
    }

    /// Seconds a group membership stays live without a refresh.
    pub fn group_expiry(mut self, secs: u64) -> Self {
        self.group_expiry_secs = secs;
        self
    }

    /// Replace the default MessagePack codec.
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Enable authenticated encryption of stored payloads.
    ///
    /// The first key encrypts; all keys are tried for decryption, so keys
    /// can be rotated by prepending the new one.
    #[cfg(feature = "encryption")]
    pub fn symmetric_encryption_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        // ---
        self.encryption_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Build the layer (consumes self). Connections are opened lazily on
    /// first use, so this never touches the network.
    ///
    /// # Errors
    ///
    /// `Configuration` if no shard was added, the prefix is empty, or the
    /// capacity is zero.
    pub fn build(self) -> Result<QueueLayer> {
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

        #[cfg(feature = "encryption")]
        let codec = if self.encryption_keys.is_empty() {
            codec
        } else {
            Arc::new(crate::EncryptedCodec::new(codec, &self.encryption_keys)?)
        };

        Ok(QueueLayer {
            prefix: self.prefix,
            capacity: self.capacity,
            expiry_secs: self.expiry_secs,
            group_expiry_secs: self.group_expiry_secs,
            codec,
            shards: self
                .targets
                .into_iter()
                .map(|target| Arc::new(ShardPool::new(target)))
                .collect(),
            send_script: Script::new(scripts::SEND),
            group_send_script: Script::new(scripts::GROUP_SEND),
            next_shard: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for QueueLayerBuilder {
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
            QueueLayer::builder().build(),
            Err(Error::Configuration(_))
        ));
        assert!(QueueLayer::builder().host("redis://localhost").build().is_ok());
    }

    #[test]
    fn test_builder_rejects_degenerate_config() {
        // ---
        assert!(QueueLayer::builder()
            .host("redis://localhost")
            .capacity(0)
            .build()
            .is_err());
        assert!(QueueLayer::builder()
            .host("redis://localhost")
            .prefix("")
            .build()
            .is_err());
    }

    #[test]
    fn test_key_naming() {
        // ---
        let layer = QueueLayer::builder()
            .host("redis://localhost")
            .prefix("app")
            .build()
            .unwrap();
        assert_eq!(layer.channel_key("chat"), "app:ch:chat");
        assert_eq!(layer.group_key("room"), "app:grp:room");
    }

    #[test]
    fn test_wire_payload_shape() {
        // ---
        let layer = QueueLayer::builder().host("redis://localhost").build().unwrap();
        let message = Message::new("t").with("i", 1);

        let payload = layer.wire_payload(&message).unwrap();
        assert!(payload.len() > MESSAGE_ID_LEN);
        assert_eq!(layer.decode_entry(&payload).unwrap(), message);

        // Distinct sends of the same message differ on the wire.
        let other = layer.wire_payload(&message).unwrap();
        assert_ne!(payload[..MESSAGE_ID_LEN], other[..MESSAGE_ID_LEN]);

        assert!(layer.decode_entry(&payload[..4]).is_err());
    }

    #[tokio::test]
    async fn test_new_channel_shape_and_routing() {
        // ---
        let layer = QueueLayer::builder()
            .hosts(["redis://a", "redis://b", "redis://c"])
            .build()
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            let name = layer.new_channel("specific").await.unwrap();
            assert!(name.starts_with("specific."));
            assert_eq!(name.matches('!').count(), 1);
            assert!(seen.insert(name.clone()));
            // The advertised shard is stable for any process with 3 hosts.
            assert!(shard::shard_index(&name, 3) < 3);
        }

        // Round-robin walks every shard.
        let shards: std::collections::HashSet<usize> = seen
            .iter()
            .map(|name| shard::shard_index(name, 3))
            .collect();
        assert_eq!(shards.len(), 3);
    }
}
