#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

//! Pub/sub-layer integration tests.
//!
//! Everything that talks to Redis expects `redis://127.0.0.1:6379` and is
//! `#[ignore]`d by default; run with `cargo test -- --ignored`. Two layer
//! instances in one process stand in for two subscriber processes — each
//! keeps its own subscriber connection and local queues, so the delivery
//! paths are the real cross-process ones.

use std::time::Duration;

use tokio::time::timeout;

use channel_layers::{
    // ---
    ChannelLayer,
    Message,
    PubSubLayer,
    Result,
    Value,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

fn layer(prefix: &str) -> PubSubLayer {
    // ---
    PubSubLayer::builder()
        .host(REDIS_URL)
        .prefix(prefix)
        .build()
        .unwrap()
}

/// Kick off a receive so the subscription exists, without consuming it.
async fn subscribed(layer: &PubSubLayer, channel: &str) -> Result<()> {
    // ---
    let pending = timeout(Duration::from_millis(100), layer.receive(channel)).await;
    assert!(pending.is_err(), "receive returned before anything was sent");
    Ok(())
}

#[tokio::test]
#[ignore = "needs redis://127.0.0.1:6379"]
async fn test_broadcast_between_instances() -> Result<()> {
    // ---
    init_tracing();

    let subscriber = layer("plt-bcast");
    let publisher = layer("plt-bcast");

    subscribed(&subscriber, "news").await?;

    publisher
        .send("news", Message::new("n").with("msg", "hi"))
        .await?;

    let got = timeout(Duration::from_secs(1), subscriber.receive("news"))
        .await
        .expect("broadcast not delivered within 1s")?;
    assert_eq!(got.get("msg").and_then(Value::as_str), Some("hi"));

    subscriber.close().await?;
    publisher.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs redis://127.0.0.1:6379"]
async fn test_local_fast_path() -> Result<()> {
    // ---
    init_tracing();

    let layer = layer("plt-local");
    subscribed(&layer, "here").await?;

    // The channel is hosted by this instance, so the send enqueues
    // directly, no broker round trip.
    layer.send("here", Message::new("t").with("i", 1)).await?;

    let got = timeout(Duration::from_secs(1), layer.receive("here"))
        .await
        .expect("local delivery failed")?;
    assert_eq!(got.get("i").and_then(Value::as_i64), Some(1));

    layer.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs redis://127.0.0.1:6379"]
async fn test_group_broadcast_reaches_both_subscribers() -> Result<()> {
    // ---
    init_tracing();

    let first = layer("plt-group");
    let second = layer("plt-group");
    let sender = layer("plt-group");

    let ch_first = first.new_channel("sub").await?;
    let ch_second = second.new_channel("sub").await?;

    first.group_add("g", &ch_first).await?;
    second.group_add("g", &ch_second).await?;

    sender
        .group_send("g", Message::new("n").with("msg", "hi"))
        .await?;

    for (layer, channel) in [(&first, &ch_first), (&second, &ch_second)] {
        let got = timeout(Duration::from_secs(1), layer.receive(channel))
            .await
            .expect("group broadcast not delivered within 1s")?;
        assert_eq!(got.get("msg").and_then(Value::as_str), Some("hi"));
    }

    first.close().await?;
    second.close().await?;
    sender.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs redis://127.0.0.1:6379"]
async fn test_group_discard_stops_delivery() -> Result<()> {
    // ---
    init_tracing();

    let subscriber = layer("plt-discard");
    let sender = layer("plt-discard");

    let channel = subscriber.new_channel("sub").await?;
    subscriber.group_add("g", &channel).await?;
    subscriber.group_discard("g", &channel).await?;

    sender.group_send("g", Message::new("n")).await?;

    let silent = timeout(Duration::from_millis(500), subscriber.receive(&channel)).await;
    assert!(silent.is_err(), "discarded member still got the broadcast");

    subscriber.close().await?;
    sender.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs redis://127.0.0.1:6379"]
async fn test_release_channel_wakes_receiver() -> Result<()> {
    // ---
    init_tracing();

    let layer = std::sync::Arc::new(layer("plt-release"));
    let channel = layer.new_channel("sub").await?;

    let receiver = {
        let layer = std::sync::Arc::clone(&layer);
        let channel = channel.clone();
        tokio::spawn(async move { layer.receive(&channel).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    layer.release_channel(&channel).await?;

    let outcome = timeout(Duration::from_secs(1), receiver)
        .await
        .expect("receiver never woke")
        .unwrap();
    assert!(outcome.is_err(), "released channel still delivered");

    layer.close().await?;
    Ok(())
}

use std::sync::Once;

static INIT: Once = Once::new();

fn init_tracing() {
    // ---
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_line_number(true)
            .with_ansi(false)
            .try_init();
    });
}
