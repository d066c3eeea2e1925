// src/layers/queue/pool.rs

//! Per-shard connection pool.
//!
//! A small free-list of multiplexed connections per shard, created lazily
//! and owned by the layer instance (and therefore by the runtime that owns
//! the layer — a connection never crosses cooperative domains).
//!
//! Two rules keep the pool honest:
//!
//! - a connection that saw an error is dropped, never returned, so the pool
//!   refills with a fresh connection (and, under sentinel, a freshly
//!   discovered primary) on the next call;
//! - a connection abandoned mid-`BLPOP` is dropped too, because the server
//!   may still deliver a pop on it later.

use tokio::sync::Mutex;

use redis::aio::MultiplexedConnection;

use crate::layers::ConnectTarget;
use crate::Result;

/// Idle connections kept per shard; anything beyond is dropped on release.
const MAX_IDLE: usize = 8;

pub(super) struct ShardPool {
    target: ConnectTarget,
    free: Mutex<Vec<MultiplexedConnection>>,
}

impl ShardPool {
    // ---

    pub(super) fn new(target: ConnectTarget) -> Self {
        // ---
        Self {
            target,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take an idle connection or open a new one.
    pub(super) async fn acquire(&self) -> Result<MultiplexedConnection> {
        // ---
        if let Some(conn) = self.free.lock().await.pop() {
            return Ok(conn);
        }
        self.target.connect().await
    }

    /// Return a healthy connection to the free list.
    pub(super) async fn release(&self, conn: MultiplexedConnection) {
        // ---
        let mut free = self.free.lock().await;
        if free.len() < MAX_IDLE {
            free.push(conn);
        }
    }

    /// Drop every idle connection.
    pub(super) async fn clear(&self) {
        self.free.lock().await.clear();
    }
}
