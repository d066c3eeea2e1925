#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use std::time::Duration;

use tokio::time::timeout;

use channel_layers::{
    // ---
    ChannelLayer,
    Error,
    InMemoryLayer,
    InMemoryLayerConfig,
    Message,
    Result,
    Value,
};

fn layer_with_capacity(capacity: usize) -> InMemoryLayer {
    // ---
    InMemoryLayer::new(InMemoryLayerConfig {
        capacity,
        ..InMemoryLayerConfig::default()
    })
}

fn numbered(i: i64) -> Message {
    Message::new("t").with("i", i)
}

fn index_of(message: &Message) -> Option<i64> {
    message.get("i").and_then(Value::as_i64)
}

#[tokio::test]
async fn test_single_producer_fifo() -> Result<()> {
    // ---
    init_tracing();

    let layer = layer_with_capacity(3);
    for i in 1..=3 {
        layer.send("a", numbered(i)).await?;
    }

    for i in 1..=3 {
        let got = layer.receive("a").await?;
        assert_eq!(index_of(&got), Some(i));
    }

    // Nothing left: a fourth receive blocks until cancelled.
    let blocked = timeout(Duration::from_millis(100), layer.receive("a")).await;
    assert!(blocked.is_err(), "receive on drained channel returned");
    Ok(())
}

#[tokio::test]
async fn test_capacity_refusal() -> Result<()> {
    // ---
    init_tracing();

    let layer = layer_with_capacity(2);
    layer.send("a", numbered(1)).await?;
    layer.send("a", numbered(2)).await?;

    match layer.send("a", numbered(3)).await {
        Err(Error::ChannelFull { channel }) => assert_eq!(channel, "a"),
        other => panic!("expected ChannelFull, got {other:?}"),
    }

    // Draining one slot makes room again.
    layer.receive("a").await?;
    layer.send("a", numbered(3)).await?;
    Ok(())
}

#[tokio::test]
async fn test_group_fan_out() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();
    layer.group_add("g", "a").await?;
    layer.group_add("g", "b").await?;

    layer
        .group_send("g", Message::new("x").with("v", "hi"))
        .await?;

    for channel in ["a", "b"] {
        let got = layer.receive(channel).await?;
        assert_eq!(got.msg_type(), Some("x"));
        assert_eq!(got.get("v").and_then(Value::as_str), Some("hi"));
    }
    Ok(())
}

#[tokio::test]
async fn test_group_discard_stops_delivery() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();
    layer.group_add("g", "a").await?;
    layer.group_add("g", "b").await?;
    layer.group_discard("g", "a").await?;

    layer.group_send("g", Message::new("x")).await?;

    let got = layer.receive("b").await?;
    assert_eq!(got.msg_type(), Some("x"));

    let silent = timeout(Duration::from_millis(100), layer.receive("a")).await;
    assert!(silent.is_err(), "discarded member still got the broadcast");
    Ok(())
}

#[tokio::test]
async fn test_group_full_member_is_skipped() -> Result<()> {
    // ---
    init_tracing();

    let layer = layer_with_capacity(1);
    layer.group_add("g", "full").await?;
    layer.group_add("g", "free").await?;
    layer.send("full", numbered(0)).await?;

    // Broadcast never raises for a member at capacity.
    layer.group_send("g", Message::new("x")).await?;

    let got = layer.receive("free").await?;
    assert_eq!(got.msg_type(), Some("x"));
    Ok(())
}

#[tokio::test]
async fn test_receive_wakes_on_send() -> Result<()> {
    // ---
    init_tracing();

    let layer = std::sync::Arc::new(InMemoryLayer::default());
    let receiver = {
        let layer = layer.clone();
        tokio::spawn(async move { layer.receive("wake").await })
    };
    tokio::task::yield_now().await;

    layer.send("wake", numbered(7)).await?;

    let got = timeout(Duration::from_secs(1), receiver)
        .await
        .expect("receiver never woke")
        .unwrap()?;
    assert_eq!(index_of(&got), Some(7));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_receive_leaves_queue_intact() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();

    // Cancel a receive on an empty channel, then deliver normally.
    let cancelled = timeout(Duration::from_millis(50), layer.receive("a")).await;
    assert!(cancelled.is_err());

    layer.send("a", numbered(1)).await?;
    layer.send("a", numbered(2)).await?;
    assert_eq!(index_of(&layer.receive("a").await?), Some(1));
    assert_eq!(index_of(&layer.receive("a").await?), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_new_channel_names_are_unique() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();
    let mut seen = std::collections::HashSet::new();

    for _ in 0..1_000 {
        let name = layer.new_channel("specific").await?;
        assert!(name.starts_with("specific."));
        assert!(seen.insert(name), "duplicate channel name");
    }

    // A prefix that breaks the name grammar is refused.
    assert!(layer.new_channel("bad prefix").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_flush_drops_messages_and_groups() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();
    layer.send("a", numbered(1)).await?;
    layer.group_add("g", "a").await?;

    layer.flush().await?;

    let empty = timeout(Duration::from_millis(50), layer.receive("a")).await;
    assert!(empty.is_err(), "flush left a message behind");

    // The group is gone too: broadcasting reaches nobody.
    layer.group_send("g", Message::new("x")).await?;
    let silent = timeout(Duration::from_millis(50), layer.receive("a")).await;
    assert!(silent.is_err());
    Ok(())
}

#[tokio::test]
async fn test_invalid_names_and_messages_are_rejected() -> Result<()> {
    // ---
    init_tracing();

    let layer = InMemoryLayer::default();

    assert!(matches!(
        layer.send("bad name", Message::new("t")).await,
        Err(Error::InvalidChannelName { .. })
    ));
    assert!(matches!(
        layer.group_add("bad group!", "a!b!c").await,
        Err(Error::InvalidChannelName { .. })
    ));
    assert!(matches!(
        layer.send("a", Message::new("Not.Valid")).await,
        Err(Error::InvalidMessage { .. })
    ));
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
