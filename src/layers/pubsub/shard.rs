// src/layers/pubsub/shard.rs

//! One pub/sub shard: a subscriber actor plus local delivery queues.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns both Redis connections for the
//!   shard: a multiplexed connection used only for `PUBLISH`, and a pub/sub
//!   connection split into sink + stream for `SUBSCRIBE` and incoming
//!   messages.
//! - All interaction with the Redis client is serialized through this
//!   actor; no other task ever touches the connections directly.
//! - The actor is spawned lazily on the shard's first operation.
//!
//! ## Reconnection
//!
//! When the stream ends or a command fails, the actor drops both
//! connections and reconnects with exponential backoff (100 ms base, 10 s
//! cap, jittered). On reconnect the full subscription set — every local
//! channel and every locally-joined group — is re-issued as one batch.
//! Messages published during the gap are lost; pub/sub makes no
//! persistence promise. While disconnected the actor keeps answering
//! commands: publishes fail fast, subscription changes are recorded in the
//! shared maps and picked up by the resubscribe batch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};

use tokio::sync::{mpsc, oneshot, Notify, OnceCell, RwLock};

use crate::codec::CodecPtr;
use crate::layers::{backend_err, ConnectTarget, ReconnectBackoff};
use crate::{log_debug, log_error, log_info, log_warn, Error, Message, Result};

fn channel_key(prefix: &str, name: &str) -> String {
    format!("{prefix}:ch:{name}")
}

fn group_key(prefix: &str, name: &str) -> String {
    format!("{prefix}:__group__:{name}")
}

/// Optional connection-lifecycle callbacks.
#[derive(Clone, Default)]
pub(super) struct LifecycleHooks {
    pub(super) on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(super) on_reconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Bounded in-process queue with a drop-oldest overflow policy.
///
/// Pushers never block and never fail; when the queue is full the oldest
/// entry is discarded and an overflow counter is bumped.
pub(super) struct LocalQueue {
    inner: std::sync::Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    items: VecDeque<Message>,
    closed: bool,
    overflow: u64,
}

impl LocalQueue {
    // ---

    pub(super) fn new(capacity: usize) -> Arc<Self> {
        // ---
        Arc::new(Self {
            inner: std::sync::Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                overflow: 0,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(super) fn push(&self, message: Message) {
        // ---
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.overflow += 1;
            }
            inner.items.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Pop the next message, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained. Cancellation is
    /// clean: a waiter that goes away consumes nothing.
    pub(super) async fn pop(&self) -> Option<Message> {
        // ---
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(message) = inner.items.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub(super) fn close(&self) {
        // ---
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(super) fn drain(&self) {
        self.lock().items.clear();
    }

    /// Messages dropped to make room since creation.
    pub(super) fn overflow_count(&self) -> u64 {
        self.lock().overflow
    }
}

//
// Actor commands
//

enum Cmd {
    // ---
    Publish {
        channel: String,
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        channel: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        channel: String,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

enum Step {
    // ---
    Reconnect,
    Stop,
}

type ChannelMap = Arc<RwLock<HashMap<String, Arc<LocalQueue>>>>;
type GroupMap = Arc<RwLock<HashMap<String, HashSet<String>>>>;

/// One configured host's worth of pub/sub state.
pub(super) struct PubSubShard {
    target: ConnectTarget,
    prefix: String,
    capacity: usize,
    codec: CodecPtr,
    channels: ChannelMap,
    groups: GroupMap,
    hooks: LifecycleHooks,
    cmd_tx: OnceCell<mpsc::Sender<Cmd>>,
}

impl PubSubShard {
    // ---

    pub(super) fn new(
        target: ConnectTarget,
        prefix: String,
        capacity: usize,
        codec: CodecPtr,
        hooks: LifecycleHooks,
    ) -> Arc<Self> {
        // ---
        Arc::new(Self {
            target,
            prefix,
            capacity,
            codec,
            channels: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            hooks,
            cmd_tx: OnceCell::new(),
        })
    }

    /// Spawn the actor on first use; returns its command handle.
    async fn command_channel(&self) -> mpsc::Sender<Cmd> {
        // ---
        self.cmd_tx
            .get_or_init(|| async {
                let (tx, rx) = mpsc::channel(64);
                let actor = ShardActor {
                    target: self.target.clone(),
                    prefix: self.prefix.clone(),
                    codec: Arc::clone(&self.codec),
                    channels: Arc::clone(&self.channels),
                    groups: Arc::clone(&self.groups),
                    hooks: self.hooks.clone(),
                    cmd_rx: rx,
                };
                tokio::spawn(actor.run());
                tx
            })
            .await
            .clone()
    }

    async fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        // ---
        self.command_channel()
            .await
            .send(cmd)
            .await
            .map_err(|_| Error::LayerClosed)
    }

    async fn publish(&self, channel: String, payload: Vec<u8>) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Publish {
            channel,
            payload,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::LayerClosed)?
    }

    async fn subscribe(&self, channel: String) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Subscribe { channel, resp: tx }).await?;
        rx.await.map_err(|_| Error::LayerClosed)?
    }

    /// Publish codec bytes to a channel's wire name.
    pub(super) async fn publish_channel(&self, name: &str, payload: Vec<u8>) -> Result<()> {
        self.publish(channel_key(&self.prefix, name), payload).await
    }

    /// Publish codec bytes to a group's reserved wire name.
    pub(super) async fn publish_group(&self, group: &str, payload: Vec<u8>) -> Result<()> {
        self.publish(group_key(&self.prefix, group), payload).await
    }

    /// Enqueue directly if the channel is hosted here; hands the message
    /// back if it is not.
    pub(super) async fn deliver_local(&self, name: &str, message: Message) -> Option<Message> {
        // ---
        match self.channels.read().await.get(name) {
            Some(queue) => {
                queue.push(message);
                None
            }
            None => Some(message),
        }
    }

    /// Get the channel's local queue, creating it and subscribing on first
    /// use. Subscriptions are refcounted by presence in the channel map —
    /// repeated receives never resubscribe.
    pub(super) async fn ensure_channel(&self, name: &str) -> Result<Arc<LocalQueue>> {
        // ---
        if let Some(queue) = self.channels.read().await.get(name) {
            return Ok(Arc::clone(queue));
        }

        let queue = {
            let mut channels = self.channels.write().await;
            match channels.entry(name.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    return Ok(Arc::clone(entry.get()))
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    Arc::clone(slot.insert(LocalQueue::new(self.capacity)))
                }
            }
        };

        // On failure the map entry stays: the connect path resubscribes the
        // whole set, so the channel is covered once the shard recovers.
        self.subscribe(channel_key(&self.prefix, name)).await?;
        Ok(queue)
    }

    /// Record a local group membership; subscribes the reserved group
    /// channel the first time any local channel joins the group.
    pub(super) async fn group_join(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        self.ensure_channel(channel).await?;

        let first_member = {
            let mut groups = self.groups.write().await;
            let members = groups.entry(group.to_string()).or_default();
            let first = members.is_empty();
            members.insert(channel.to_string());
            first
        };

        if first_member {
            self.subscribe(group_key(&self.prefix, group)).await?;
        }
        Ok(())
    }

    /// Drop a local group membership; unsubscribes the reserved group
    /// channel when the last member leaves.
    pub(super) async fn group_leave(&self, group: &str, channel: &str) -> Result<()> {
        // ---
        let emptied = {
            let mut groups = self.groups.write().await;
            match groups.get_mut(group) {
                None => false,
                Some(members) => {
                    members.remove(channel);
                    if members.is_empty() {
                        groups.remove(group);
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if emptied {
            self.send_cmd(Cmd::Unsubscribe {
                channel: group_key(&self.prefix, group),
            })
            .await?;
        }
        Ok(())
    }

    /// Tear down a channel this consumer no longer owns: close its queue,
    /// drop it from every local group, release the subscriptions.
    pub(super) async fn release_channel(&self, name: &str) -> Result<()> {
        // ---
        match self.channels.write().await.remove(name) {
            Some(queue) => queue.close(),
            None => return Ok(()),
        }

        let emptied: Vec<String> = {
            let mut groups = self.groups.write().await;
            let mut emptied = Vec::new();
            groups.retain(|group, members| {
                members.remove(name);
                if members.is_empty() {
                    emptied.push(group.clone());
                    false
                } else {
                    true
                }
            });
            emptied
        };

        for group in emptied {
            self.send_cmd(Cmd::Unsubscribe {
                channel: group_key(&self.prefix, &group),
            })
            .await?;
        }

        self.send_cmd(Cmd::Unsubscribe {
            channel: channel_key(&self.prefix, name),
        })
        .await
    }

    /// Stop the actor and wake every local popper.
    pub(super) async fn shutdown(&self) {
        // ---
        {
            let mut channels = self.channels.write().await;
            for queue in channels.values() {
                queue.close();
            }
            channels.clear();
        }
        self.groups.write().await.clear();

        if let Some(tx) = self.cmd_tx.get() {
            let (resp, done) = oneshot::channel();
            if tx.send(Cmd::Close { resp }).await.is_ok() {
                let _ = done.await;
            }
        }
    }

    /// Messages dropped from a channel's local queue since it was created.
    pub(super) async fn channel_overflow(&self, name: &str) -> Option<u64> {
        // ---
        self.channels
            .read()
            .await
            .get(name)
            .map(|queue| queue.overflow_count())
    }

    /// Drop everything queued locally. Nothing is persisted server-side,
    /// so there is nothing else to flush.
    pub(super) async fn flush_local(&self) {
        // ---
        for queue in self.channels.read().await.values() {
            queue.drain();
        }
    }
}

//
// The actor
//

struct Link {
    publish: MultiplexedConnection,
    sink: PubSubSink,
    stream: PubSubStream,
}

struct ShardActor {
    // ---
    target: ConnectTarget,
    prefix: String,
    codec: CodecPtr,
    channels: ChannelMap,
    groups: GroupMap,
    hooks: LifecycleHooks,
    cmd_rx: mpsc::Receiver<Cmd>,
}

impl ShardActor {
    // ---

    async fn run(mut self) {
        // ---
        let mut backoff = ReconnectBackoff::new();
        let mut connected_before = false;

        loop {
            let link = match self.connect().await {
                Ok(link) => link,
                Err(_err) => {
                    log_warn!("pubsub shard connect failed: {_err}");
                    if matches!(self.idle(backoff.next_delay()).await, Step::Stop) {
                        return;
                    }
                    continue;
                }
            };

            backoff.reset();
            if connected_before {
                log_info!("pubsub shard reconnected, subscriptions replayed");
                if let Some(hook) = &self.hooks.on_reconnect {
                    hook();
                }
            }
            connected_before = true;

            match self.serve(link).await {
                Step::Stop => return,
                Step::Reconnect => {
                    if let Some(hook) = &self.hooks.on_disconnect {
                        hook();
                    }
                }
            }
        }
    }

    /// Open both connections and re-issue the full subscription set as a
    /// single batch.
    async fn connect(&self) -> Result<Link> {
        // ---
        let client = self.target.client().await?;

        let publish = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| backend_err("pubsub connect", err))?;

        let (mut sink, stream) = client
            .get_async_pubsub()
            .await
            .map_err(|err| backend_err("pubsub connect", err))?
            .split();

        let wire_channels: Vec<String> = {
            let channels = self.channels.read().await;
            let groups = self.groups.read().await;
            channels
                .keys()
                .map(|name| channel_key(&self.prefix, name))
                .chain(groups.keys().map(|group| group_key(&self.prefix, group)))
                .collect()
        };

        if !wire_channels.is_empty() {
            sink.subscribe(&wire_channels)
                .await
                .map_err(|err| backend_err("resubscribe", err))?;
        }

        Ok(Link {
            publish,
            sink,
            stream,
        })
    }

    /// Wait out a backoff delay, still answering commands.
    async fn idle(&mut self, delay: Duration) -> Step {
        // ---
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Step::Reconnect,

                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Step::Stop,
                    Some(Cmd::Publish { resp, .. }) => {
                        let _ = resp.send(Err(Error::BackendUnavailable(
                            "pubsub shard disconnected".to_string(),
                        )));
                    }
                    // Subscription state lives in the shared maps and is
                    // applied wholesale on reconnect.
                    Some(Cmd::Subscribe { resp, .. }) => {
                        let _ = resp.send(Ok(()));
                    }
                    Some(Cmd::Unsubscribe { .. }) => {}
                    Some(Cmd::Close { resp }) => {
                        let _ = resp.send(());
                        return Step::Stop;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, mut link: Link) -> Step {
        // ---
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Step::Stop,
                    Some(cmd) => {
                        if let Some(step) = self.handle_cmd(cmd, &mut link).await {
                            return step;
                        }
                    }
                },

                incoming = link.stream.next() => match incoming {
                    Some(msg) => self.dispatch(msg).await,
                    None => {
                        log_error!("pubsub stream ended, reconnecting");
                        return Step::Reconnect;
                    }
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd, link: &mut Link) -> Option<Step> {
        // ---
        match cmd {
            Cmd::Publish {
                channel,
                payload,
                resp,
            } => {
                let published: std::result::Result<i64, redis::RedisError> =
                    redis::cmd("PUBLISH")
                        .arg(&channel)
                        .arg(&payload)
                        .query_async(&mut link.publish)
                        .await;
                match published {
                    Ok(_) => {
                        let _ = resp.send(Ok(()));
                        None
                    }
                    Err(err) => {
                        let _ = resp.send(Err(backend_err("publish", err)));
                        Some(Step::Reconnect)
                    }
                }
            }

            Cmd::Subscribe { channel, resp } => match link.sink.subscribe(&channel).await {
                Ok(()) => {
                    let _ = resp.send(Ok(()));
                    None
                }
                Err(err) => {
                    let _ = resp.send(Err(backend_err("subscribe", err)));
                    Some(Step::Reconnect)
                }
            },

            Cmd::Unsubscribe { channel } => match link.sink.unsubscribe(&channel).await {
                Ok(()) => None,
                Err(_err) => {
                    log_warn!("unsubscribe failed: {_err}");
                    Some(Step::Reconnect)
                }
            },

            Cmd::Close { resp } => {
                let _ = resp.send(());
                Some(Step::Stop)
            }
        }
    }

    /// Demultiplex one incoming broadcast to the local queues it targets.
    async fn dispatch(&self, msg: redis::Msg) {
        // ---
        let wire = msg.get_channel_name().to_string();

        let payload: Vec<u8> = match msg.get_payload() {
            Ok(payload) => payload,
            Err(_err) => {
                log_debug!("pubsub payload read failed on {wire}: {_err}");
                return;
            }
        };

        let message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(_err) => {
                log_debug!("undecodable pubsub message on {wire}: {_err}");
                return;
            }
        };

        let group_marker = group_key(&self.prefix, "");
        let channel_marker = channel_key(&self.prefix, "");

        if let Some(group) = wire.strip_prefix(&group_marker) {
            let queues: Vec<Arc<LocalQueue>> = {
                let groups = self.groups.read().await;
                let channels = self.channels.read().await;
                groups
                    .get(group)
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(|name| channels.get(name).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for queue in &queues {
                queue.push(message.clone());
            }
        } else if let Some(name) = wire.strip_prefix(&channel_marker) {
            if let Some(queue) = self.channels.read().await.get(name).cloned() {
                queue.push(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_local_queue_fifo() {
        // ---
        let queue = LocalQueue::new(4);
        for i in 0..3 {
            queue.push(Message::new("t").with("i", i));
        }
        for i in 0..3 {
            let got = queue.pop().await.unwrap();
            assert_eq!(got.get("i").and_then(crate::Value::as_i64), Some(i));
        }
    }

    #[tokio::test]
    async fn test_local_queue_drops_oldest_on_overflow() {
        // ---
        let queue = LocalQueue::new(2);
        for i in 0..5 {
            queue.push(Message::new("t").with("i", i));
        }

        assert_eq!(queue.overflow_count(), 3);
        // Survivors are the newest two, still in order.
        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(first.get("i").and_then(crate::Value::as_i64), Some(3));
        assert_eq!(second.get("i").and_then(crate::Value::as_i64), Some(4));
    }

    #[tokio::test]
    async fn test_local_queue_wakes_waiter() {
        // ---
        let queue = LocalQueue::new(4);
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.push(Message::new("t"));
        let got = popper.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_local_queue_close_releases_waiters() {
        // ---
        let queue = LocalQueue::new(4);
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert!(popper.await.unwrap().is_none());

        // Pushing after close is a no-op.
        queue.push(Message::new("t"));
        assert!(queue.pop().await.is_none());
    }
}
