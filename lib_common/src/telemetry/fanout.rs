//! # Broadcast Fanout
//!
//! Delivers every generated reading to every registered subscriber. The reading
//! is serialised once; each client gets its own copy of the frame. A client whose
//! write fails is closed and removed on the spot, and delivery carries on with the
//! rest of the snapshot, so one broken socket costs the others nothing beyond its
//! own write latency.

use super::reading::Reading;
use super::registry::{ClientRegistry, DeliveryError};
use tokio::sync::mpsc;

/// Outcome of one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Clients that received the reading, had it queued behind their replay,
    /// or already had it from replay.
    pub delivered: usize,
    /// Clients removed because the write failed.
    pub removed: usize,
}

/// Writes `reading` to every member of `registry`, unregistering failures.
pub async fn deliver(
    registry: &ClientRegistry,
    reading: &Reading,
) -> Result<DeliveryReport, DeliveryError> {
    let payload = serde_json::to_string(reading)?;
    let mut report = DeliveryReport::default();

    for client in registry.snapshot() {
        match client.send(reading.seq, payload.clone()).await {
            Ok(_) => report.delivered += 1,
            Err(e) => {
                log::warn!("Client {} write failed: {}. Removing.", client.id(), e);
                registry.unregister(client.id()).await;
                report.removed += 1;
            }
        }
    }
    Ok(report)
}

/// Consumes the hand-off buffer until every sender is gone, then returns. This
/// is what drains pending readings during shutdown.
pub async fn run_fanout(registry: &ClientRegistry, mut rx: mpsc::Receiver<Reading>) {
    log::info!("Fanout started.");
    while let Some(reading) = rx.recv().await {
        match deliver(registry, &reading).await {
            Ok(report) if report.removed > 0 => {
                log::info!(
                    "Reading {} delivered to {} client(s), {} removed",
                    reading.seq,
                    report.delivered,
                    report.removed
                );
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to broadcast reading {}: {}", reading.seq, e),
        }

        log::info!(
            "[{}] Speed: {:.2} km/h | Temp: {:.2}°C | Pressure: {:.2} Pa",
            reading.timestamp.format("%H:%M:%S"),
            reading.speed,
            reading.temperature,
            reading.pressure
        );
    }
    log::info!("Fanout drained, exiting.");
}
