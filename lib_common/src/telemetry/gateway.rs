//! # Subscription Gateway
//!
//! Accepts realtime subscribers on `/ws`, replays recent history to them, and
//! relays their `speedDelta` messages to the control parameter.
//!
//! ## Attach ordering
//!
//! A new client is registered *before* history is read, in replaying mode.
//! Live deliveries that reach it in the meantime are queued on its handle
//! instead of written, so the fanout never waits on a replay. Once the history
//! is flushed the queue is drained, skipping any reading whose sequence was
//! already part of the replay, and the client switches to direct writes.
//! Since the generator persists a reading before handing it to the fanout, a
//! reading produced during attach therefore reaches the client exactly once,
//! after the history. The one gap is a reading whose append failed: it is never
//! in history, so a client attaching while it is in flight may miss it.

use super::engine::AppContext;
use super::reading::Reading;
use super::registry::{ClientHandle, ClientId, ClientSink, DeliveryError};
use super::store::ReadingStore;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{future, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

/// Messages a subscriber may send. Anything with an unrecognised `type` is
/// `Unknown` and ignored; recognised types with a malformed payload fail to parse.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Adjust the shared speed by `value`.
    #[serde(rename = "speedDelta")]
    SpeedDelta { value: f64 },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Upgrades `GET /ws` to a WebSocket subscription.
pub async fn ws_handler<S: ReadingStore>(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext<S>>>,
) -> impl IntoResponse {
    ws.on_failed_upgrade(|e| log::warn!("WebSocket upgrade error: {}", e))
        .on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket<S: ReadingStore>(socket: WebSocket, ctx: Arc<AppContext<S>>) {
    let (sink, stream) = socket.split();
    let sink: ClientSink = Box::pin(
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))))
            .sink_map_err(DeliveryError::Transport),
    );

    let handle = match attach(&ctx, sink).await {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("Dropping subscriber during history replay: {}", e);
            return;
        }
    };

    receive_loop(&ctx, handle.id(), stream).await;
    ctx.clients.unregister(handle.id()).await;
}

/// Registers `sink` as a subscriber and replays up to `replay_len` readings,
/// oldest first, followed by whatever live readings were queued meanwhile.
///
/// On a write failure the client is unregistered again and the error is
/// returned.
pub async fn attach<S: ReadingStore>(
    ctx: &AppContext<S>,
    sink: ClientSink,
) -> Result<Arc<ClientHandle>, DeliveryError> {
    let handle = ctx.clients.new_replaying_handle(sink);
    ctx.clients.register(Arc::clone(&handle));

    let history = match ctx.store.history(ctx.config.replay_len).await {
        Ok(history) => history,
        Err(e) => {
            log::error!("DB query error while sending last entries: {}", e);
            Vec::new()
        }
    };

    match replay(&handle, &history).await {
        Ok(count) => {
            log::debug!("Replayed {} reading(s) to client {}", count, handle.id());
            Ok(handle)
        }
        Err(e) => {
            ctx.clients.unregister(handle.id()).await;
            Err(e)
        }
    }
}

async fn replay(handle: &ClientHandle, history: &[Reading]) -> Result<usize, DeliveryError> {
    let mut outbound = handle.outbound().await;
    let mut sent = 0;
    for reading in history {
        let payload = serde_json::to_string(reading)?;
        if outbound.write(reading.seq, payload).await? {
            sent += 1;
        }
    }

    loop {
        let queued = handle.drain_pending();
        if queued.is_empty() {
            return Ok(sent);
        }
        for (seq, payload) in queued {
            if outbound.write(seq, payload).await? {
                sent += 1;
            }
        }
    }
}

/// Applies one inbound text frame. Returns the new speed when the frame was a
/// valid `speedDelta`.
pub fn handle_inbound<S>(ctx: &AppContext<S>, client: ClientId, text: &str) -> Option<f64> {
    match InboundMessage::parse(text) {
        Ok(InboundMessage::SpeedDelta { value }) => Some(ctx.control.apply_delta(value)),
        Ok(InboundMessage::Unknown) => {
            log::debug!("Client {} sent an unrecognised message type, ignoring", client);
            None
        }
        Err(e) => {
            log::debug!("Client {} sent a malformed message ({}), ignoring", client, e);
            None
        }
    }
}

/// Reads frames until the client closes, a read fails, or the server shuts down.
pub async fn receive_loop<S, St>(ctx: &AppContext<S>, client: ClientId, mut stream: St)
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_inbound(ctx, client, text.as_str());
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::debug!("Client {} read error: {}", client, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::config::EngineConfig;
    use crate::telemetry::fanout::deliver;
    use crate::telemetry::registry::tests::{channel_sink, slow_sink};
    use crate::telemetry::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use futures_util::stream;
    use std::time::{Duration as StdDuration, Instant};

    fn reading(seq: u64) -> Reading {
        Reading {
            seq,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(seq as i64),
            speed: 80.0 + seq as f64,
            temperature: 20.3,
            pressure: 100.3,
        }
    }

    fn context() -> AppContext<MemoryStore> {
        AppContext::new(EngineConfig::default(), MemoryStore::new())
    }

    fn speed_of(frame: &str) -> f64 {
        serde_json::from_str::<Reading>(frame).unwrap().speed
    }

    #[test]
    fn test_parse_inbound_messages() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"speedDelta","value":5}"#).unwrap(),
            InboundMessage::SpeedDelta { value: 5.0 }
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"speedDelta","value":-2.5}"#).unwrap(),
            InboundMessage::SpeedDelta { value: -2.5 }
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"reset","value":1}"#).unwrap(),
            InboundMessage::Unknown
        );
        assert!(InboundMessage::parse(r#"{"type":"speedDelta","value":"5"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"type":"speedDelta"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"value":5}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
    }

    #[test]
    fn test_handle_inbound_applies_only_speed_deltas() {
        let ctx = context();
        assert_eq!(handle_inbound(&ctx, 1, r#"{"type":"speedDelta","value":30}"#), Some(125.0));
        assert_eq!(handle_inbound(&ctx, 1, r#"{"type":"other","value":-30}"#), None);
        assert_eq!(handle_inbound(&ctx, 1, r#"{"type":"speedDelta","value":"x"}"#), None);
        assert_eq!(handle_inbound(&ctx, 1, r#"{"type":"speedDelta","value":-60}"#), Some(75.0));
        assert_eq!(ctx.control.read(), 75.0);
    }

    #[tokio::test]
    async fn test_replay_then_live_in_order() {
        let ctx = context();
        for seq in 1..=12 {
            ctx.store.append(&reading(seq)).await.unwrap();
        }

        let (sink, mut rx) = channel_sink();
        let handle = attach(&ctx, sink).await.unwrap();
        assert!(ctx.clients.contains(handle.id()));

        for seq in 13..=15 {
            let r = reading(seq);
            ctx.store.append(&r).await.unwrap();
            deliver(&ctx.clients, &r).await.unwrap();
        }

        let frames: Vec<String> = (&mut rx).take(13).collect().await;
        let speeds: Vec<f64> = frames.iter().map(|f| speed_of(f)).collect();
        let expected: Vec<f64> = (3..=15).map(|seq| 80.0 + seq as f64).collect();
        assert_eq!(speeds, expected);
    }

    #[tokio::test]
    async fn test_reading_in_history_and_live_is_sent_once() {
        let ctx = context();
        let raced = reading(1);
        // Persisted before attach, delivered live after it.
        ctx.store.append(&raced).await.unwrap();

        let (sink, mut rx) = channel_sink();
        let handle = attach(&ctx, sink).await.unwrap();

        let report = deliver(&ctx.clients, &raced).await.unwrap();
        assert_eq!(report.delivered, 1);
        deliver(&ctx.clients, &reading(2)).await.unwrap();
        ctx.clients.unregister(handle.id()).await;

        let frames: Vec<String> = rx.collect().await;
        let speeds: Vec<f64> = frames.iter().map(|f| speed_of(f)).collect();
        assert_eq!(speeds, vec![81.0, 82.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_attach_sees_each_reading_once() {
        for _ in 0..20 {
            let ctx = Arc::new(context());
            for seq in 1..=3 {
                ctx.store.append(&reading(seq)).await.unwrap();
            }

            let (sink, mut rx) = channel_sink();
            let attach_ctx = Arc::clone(&ctx);
            let attaching = tokio::spawn(async move { attach(&attach_ctx, sink).await.map(|h| h.id()) });

            // Generator order: persist, then fan out. Whichever side of the
            // registration this lands on, the client sees it exactly once.
            let live = reading(4);
            ctx.store.append(&live).await.unwrap();
            deliver(&ctx.clients, &live).await.unwrap();

            let id = attaching.await.unwrap().unwrap();
            deliver(&ctx.clients, &reading(5)).await.unwrap();
            ctx.clients.unregister(id).await;

            let frames: Vec<String> = (&mut rx).collect().await;
            let speeds: Vec<f64> = frames.iter().map(|f| speed_of(f)).collect();
            assert_eq!(speeds, vec![81.0, 82.0, 83.0, 84.0, 85.0]);
        }
    }

    #[tokio::test]
    async fn test_slow_replay_does_not_stall_other_clients() {
        let ctx = Arc::new(context());
        for seq in 1..=10 {
            ctx.store.append(&reading(seq)).await.unwrap();
        }

        let (healthy_sink, mut healthy_rx) = channel_sink();
        ctx.clients.register(ctx.clients.new_handle(healthy_sink));

        let (slow, mut slow_rx) = slow_sink(StdDuration::from_millis(100));
        let attach_ctx = Arc::clone(&ctx);
        let attaching = tokio::spawn(async move { attach(&attach_ctx, slow).await.map(|h| h.id()) });
        while ctx.clients.len() < 2 {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        let live = reading(11);
        ctx.store.append(&live).await.unwrap();
        let started = Instant::now();
        let report = deliver(&ctx.clients, &live).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < StdDuration::from_millis(300), "fanout waited {:?} on a replay", elapsed);
        assert_eq!(report.delivered, 2);
        assert_eq!(speed_of(&healthy_rx.next().await.unwrap()), 91.0);

        // The attaching client still gets history then the queued reading, once each.
        attaching.await.unwrap().unwrap();
        let frames: Vec<String> = (&mut slow_rx).take(11).collect().await;
        let speeds: Vec<f64> = frames.iter().map(|f| speed_of(f)).collect();
        let expected: Vec<f64> = (1..=11).map(|seq| 80.0 + seq as f64).collect();
        assert_eq!(speeds, expected);
    }

    #[tokio::test]
    async fn test_failed_replay_unregisters_client() {
        let ctx = context();
        ctx.store.append(&reading(1)).await.unwrap();

        let (sink, rx) = channel_sink();
        drop(rx);

        assert!(attach(&ctx, sink).await.is_err());
        assert!(ctx.clients.is_empty());
    }

    #[tokio::test]
    async fn test_receive_loop_applies_deltas_until_close() {
        let ctx = context();
        let frames: Vec<Result<Message, axum::Error>> = vec![
            Ok(Message::Text(String::from(r#"{"type":"speedDelta","value":10}"#).into())),
            Ok(Message::Text(String::from(r#"{"type":"noise"}"#).into())),
            Ok(Message::Text(String::from(r#"{"type":"speedDelta","value":-4}"#).into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(String::from(r#"{"type":"speedDelta","value":100}"#).into())),
        ];

        receive_loop(&ctx, 1, stream::iter(frames)).await;
        assert_eq!(ctx.control.read(), 106.0);
    }

    #[tokio::test]
    async fn test_receive_loop_stops_on_shutdown() {
        let ctx = context();
        ctx.shutdown.cancel();
        receive_loop(&ctx, 1, stream::pending::<Result<Message, axum::Error>>()).await;
    }
}
