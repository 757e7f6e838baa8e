//! # Telemetry Engine
//!
//! Owns the process-wide state and supervises the background tasks.
//!
//! [`AppContext`] bundles the three lock domains (control parameter, store and
//! client set) together with the shutdown token, and is shared by reference with
//! every task and request handler. [`Engine`] spawns the generator, the fanout
//! consumer and the retention trimmer, and tears them down in order:
//!
//! 1. the shutdown token is cancelled;
//! 2. the generator and trimmer leave their loops; the generator drops the
//!    hand-off sender;
//! 3. the fanout delivers whatever is still buffered and exits once the buffer
//!    is closed and empty;
//! 4. [`Engine::shutdown`] returns after every task has finished.

use super::config::EngineConfig;
use super::control::ControlParameter;
use super::fanout::run_fanout;
use super::generator::{run_generator, ReadingGenerator};
use super::registry::ClientRegistry;
use super::store::{ReadingStore, Store, StoreError};
use super::trimmer::run_trimmer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Shared application state.
pub struct AppContext<S> {
    pub config: EngineConfig,
    pub control: ControlParameter,
    pub store: Store<S>,
    pub clients: ClientRegistry,
    pub shutdown: CancellationToken,
}

impl<S: ReadingStore> AppContext<S> {
    pub fn new(config: EngineConfig, backend: S) -> Self {
        Self {
            control: ControlParameter::new(config.control),
            config,
            store: Store::new(backend),
            clients: ClientRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Handle on the running background tasks.
pub struct Engine {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Engine {
    /// Spawns generator, fanout and trimmer for `ctx`. The generator continues
    /// numbering after the newest persisted reading.
    pub async fn start<S: ReadingStore>(ctx: Arc<AppContext<S>>) -> Result<Self, StoreError> {
        let next_seq = ctx.store.next_seq().await?;
        let (tx, rx) = mpsc::channel(ctx.config.fanout_capacity);
        let tracker = TaskTracker::new();

        let fanout_ctx = Arc::clone(&ctx);
        tracker.spawn(async move { run_fanout(&fanout_ctx.clients, rx).await });

        let generator_ctx = Arc::clone(&ctx);
        tracker.spawn(async move {
            run_generator(&generator_ctx, ReadingGenerator::new(next_seq), tx).await
        });

        let trimmer_ctx = Arc::clone(&ctx);
        tracker.spawn(async move { run_trimmer(&trimmer_ctx).await });

        tracker.close();
        log::info!("Telemetry engine started at sequence {}.", next_seq);

        Ok(Self {
            tracker,
            shutdown: ctx.shutdown.clone(),
        })
    }

    /// Cancels the tasks and waits until the hand-off buffer has been drained.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
        log::info!("Telemetry engine stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::gateway::attach;
    use crate::telemetry::reading::Reading;
    use crate::telemetry::registry::tests::channel_sink;
    use crate::telemetry::store::MemoryStore;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_engine_streams_to_subscriber_and_stops() {
        let config = EngineConfig {
            generation_period_ms: 10,
            ..Default::default()
        };
        let ctx = Arc::new(AppContext::new(config, MemoryStore::new()));
        let engine = Engine::start(Arc::clone(&ctx)).await.unwrap();

        let (sink, mut rx) = channel_sink();
        attach(&ctx, sink).await.unwrap();

        let mut timestamps = Vec::new();
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.next())
                .await
                .unwrap()
                .unwrap();
            let reading: Reading = serde_json::from_str(&frame).unwrap();
            timestamps.push(reading.timestamp);
        }
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));

        engine.shutdown().await;
        assert!(ctx.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_engine_resumes_sequence_from_store() {
        let ctx = Arc::new(AppContext::new(EngineConfig::default(), MemoryStore::new()));
        let previous = Reading {
            seq: 41,
            timestamp: chrono::Utc::now(),
            speed: 100.0,
            temperature: 20.45,
            pressure: 100.45,
        };
        ctx.store.append(&previous).await.unwrap();

        assert_eq!(ctx.store.next_seq().await.unwrap(), 42);
        let engine = Engine::start(Arc::clone(&ctx)).await.unwrap();
        engine.shutdown().await;
    }
}
