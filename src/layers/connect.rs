// src/layers/connect.rs

//! Connection targets shared by the Redis-backed layers.
//!
//! A [`ConnectTarget`] describes one shard endpoint: either a direct URI or
//! a sentinel group that resolves a named primary at connect time. Sentinel
//! failover is handled lazily — a dropped connection is simply rediscovered
//! on the next operation.

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use crate::{log_debug, Error, Result};

/// One shard endpoint.
#[derive(Clone, Debug)]
pub(crate) enum ConnectTarget {
    /// Direct connection, e.g. `redis://127.0.0.1:6379`.
    Direct {
        /// Redis URI.
        url: String,
    },
    /// Primary resolved through sentinel discovery.
    Sentinel {
        /// Sentinel URIs, tried in order.
        urls: Vec<String>,
        /// Name of the monitored primary.
        service_name: String,
    },
}

impl ConnectTarget {
    // ---

    /// Open a client for this target, resolving sentinels if needed.
    pub(crate) async fn client(&self) -> Result<redis::Client> {
        // ---
        let url = match self {
            ConnectTarget::Direct { url } => url.clone(),
            ConnectTarget::Sentinel { urls, service_name } => {
                discover_primary(urls, service_name).await?
            }
        };

        redis::Client::open(url.as_str())
            .map_err(|err| Error::Configuration(format!("bad redis URI {url}: {err}")))
    }

    /// Open a multiplexed command connection for this target.
    pub(crate) async fn connect(&self) -> Result<MultiplexedConnection> {
        // ---
        let client = self.client().await?;
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| backend_err("connect", err))
    }
}

/// Ask each sentinel in turn for the current primary of `service_name`.
async fn discover_primary(urls: &[String], service_name: &str) -> Result<String> {
    // ---
    for url in urls {
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(err) => {
                return Err(Error::Configuration(format!(
                    "bad sentinel URI {url}: {err}"
                )))
            }
        };

        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            log_debug!("sentinel {url} unreachable, trying next");
            continue;
        };

        let addr: Option<(String, String)> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(service_name)
            .query_async(&mut conn)
            .await
            .unwrap_or(None);

        if let Some((host, port)) = addr {
            return Ok(format!("redis://{host}:{port}"));
        }
    }

    Err(Error::BackendUnavailable(format!(
        "no sentinel knows a primary for {service_name}"
    )))
}

/// Map a client error into the crate error, tagged with the operation.
pub(crate) fn backend_err(op: &str, err: redis::RedisError) -> Error {
    Error::BackendUnavailable(format!("{op}: {err}"))
}

/// Seconds since the Unix epoch, as a float (sorted-set score resolution).
pub(crate) fn epoch_secs() -> f64 {
    // ---
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Exponential reconnect pacing: 100 ms base, 10 s cap, ±25 % jitter.
pub(crate) struct ReconnectBackoff {
    current: Duration,
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

impl ReconnectBackoff {
    // ---

    pub(crate) fn new() -> Self {
        Self {
            current: BACKOFF_BASE,
        }
    }

    /// Delay to sleep before the next attempt; doubles up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        // ---
        let delay = jittered(self.current);
        self.current = (self.current * 2).min(BACKOFF_CAP);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = BACKOFF_BASE;
    }
}

/// Spread a nominal delay across 75 %–125 % of its value, so a fleet of
/// shards that lost the same store do not retry in lockstep.
fn jittered(nominal: Duration) -> Duration {
    // ---
    // Four bytes of a v4 uuid are plenty of entropy for pacing.
    let noise = uuid::Uuid::new_v4().as_bytes()[..4]
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));

    // Scale by an integer factor in 750..=1250 per mille.
    let per_mille = 750 + noise % 501;
    nominal * per_mille / 1000
}
