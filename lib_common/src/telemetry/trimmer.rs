//! # Retention Trimmer
//!
//! Periodically shrinks the store to the newest `retention` readings. Runs on its
//! own schedule, independent of generation and delivery. A failed trim is logged
//! and the next tick simply tries again; missed ticks are skipped, never queued.

use super::engine::AppContext;
use super::store::ReadingStore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub async fn run_trimmer<S: ReadingStore>(ctx: &AppContext<S>) {
    let period = ctx.config.trim_period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log::info!("Retention trimmer started, period {:?}, keeping {}.", period, ctx.config.retention);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ctx.store.trim(ctx.config.retention).await {
            Ok(0) => {}
            Ok(removed) => log::debug!("Retention trim removed {} reading(s).", removed),
            Err(e) => log::error!("Cleanup error: {}", e),
        }
    }
    log::info!("Retention trimmer stopped.");
}
