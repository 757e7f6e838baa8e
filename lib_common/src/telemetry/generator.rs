//! # Reading Generator
//!
//! Produces one synthetic reading per tick from the current control value.
//! Temperature and pressure follow the speed with a small independent jitter:
//!
//! - `temperature = 19.45 + speed / 100 + U[0, 0.05)`
//! - `pressure    = 99.45 + speed / 100 + U[0, 0.05)`
//!
//! Each reading is appended to the store and then pushed into the bounded
//! hand-off buffer. The two steps are independent: a failed append is logged and
//! the reading is still broadcast. A full buffer blocks the generator until the
//! fanout catches up.

use super::engine::AppContext;
use super::reading::Reading;
use super::store::ReadingStore;
use chrono::{DateTime, SubsecRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const TEMPERATURE_BASE: f64 = 19.45;
const PRESSURE_BASE: f64 = 99.45;
const JITTER: f64 = 0.05;

/// Builds readings and numbers them.
pub struct ReadingGenerator<R = StdRng> {
    rng: R,
    next_seq: u64,
}

impl ReadingGenerator<StdRng> {
    /// A generator seeded from the OS, continuing at sequence `next_seq`.
    pub fn new(next_seq: u64) -> Self {
        Self::with_rng(next_seq, StdRng::from_os_rng())
    }
}

impl<R: Rng> ReadingGenerator<R> {
    pub fn with_rng(next_seq: u64, rng: R) -> Self {
        Self { rng, next_seq }
    }

    /// Builds the reading for `speed` sampled at `now`.
    pub fn next_reading(&mut self, speed: f64, now: DateTime<Utc>) -> Reading {
        let seq = self.next_seq;
        self.next_seq += 1;

        let offset = speed / 100.0;
        Reading {
            seq,
            timestamp: now.trunc_subsecs(6),
            speed,
            temperature: TEMPERATURE_BASE + offset + self.rng.random_range(0.0..JITTER),
            pressure: PRESSURE_BASE + offset + self.rng.random_range(0.0..JITTER),
        }
    }
}

/// Generator task: one reading per `generation_period` until shutdown. Dropping
/// `tx` on exit lets the fanout drain and stop.
pub async fn run_generator<S, R>(
    ctx: &AppContext<S>,
    mut generator: ReadingGenerator<R>,
    tx: mpsc::Sender<Reading>,
) where
    S: ReadingStore,
    R: Rng,
{
    let period = ctx.config.generation_period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log::info!("Generator started, period {:?}.", period);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = generator.next_reading(ctx.control.read(), Utc::now());

        if let Err(e) = ctx.store.append(&reading).await {
            log::error!("DB insert error for reading {}: {}", reading.seq, e);
        }

        tokio::select! {
            sent = tx.send(reading) => {
                if sent.is_err() {
                    log::warn!("Fanout receiver closed, stopping generator.");
                    break;
                }
            }
            _ = ctx.shutdown.cancelled() => break,
        }
    }
    log::info!("Generator stopped.");
}
