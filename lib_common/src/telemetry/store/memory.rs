use super::{ReadingStore, StoreError};
use crate::telemetry::reading::Reading;
use std::collections::VecDeque;

/// Readings kept in a deque ordered by `(timestamp, seq)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: VecDeque<Reading>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl ReadingStore for MemoryStore {
    async fn append(&mut self, reading: &Reading) -> Result<(), StoreError> {
        // Single writer means this is almost always a push_back.
        let key = (reading.timestamp, reading.seq);
        let at = self.rows.partition_point(|r| (r.timestamp, r.seq) <= key);
        self.rows.insert(at, reading.clone());
        Ok(())
    }

    async fn latest(&mut self) -> Result<Option<Reading>, StoreError> {
        Ok(self.rows.back().cloned())
    }

    async fn history(&mut self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let skip = self.rows.len().saturating_sub(limit);
        Ok(self.rows.iter().skip(skip).cloned().collect())
    }

    async fn trim(&mut self, keep: usize) -> Result<u64, StoreError> {
        let excess = self.rows.len().saturating_sub(keep);
        self.rows.drain(..excess);
        Ok(excess as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::store::Store;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(second: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(second)
    }

    fn reading(seq: u64) -> Reading {
        Reading {
            seq,
            timestamp: at(seq as i64),
            speed: 100.0,
            temperature: 20.45,
            pressure: 100.45,
        }
    }

    async fn filled(count: u64) -> Store<MemoryStore> {
        let store = Store::new(MemoryStore::new());
        for seq in 1..=count {
            store.append(&reading(seq)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_latest_on_empty_store_is_none() {
        let store = Store::new(MemoryStore::new());
        assert_eq!(store.latest().await.unwrap(), None);
        assert!(store.history(10).await.unwrap().is_empty());
        assert_eq!(store.next_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_is_oldest_to_newest_and_bounded() {
        let store = filled(15).await;

        let history = store.history(10).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (6..=15).collect::<Vec<_>>());
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        assert_eq!(store.history(50).await.unwrap().len(), 15);
        assert!(store.history(0).await.unwrap().is_empty());
        assert_eq!(store.latest().await.unwrap().unwrap().seq, 15);
        assert_eq!(store.next_seq().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_trim_keeps_most_recent_rows() {
        let store = filled(12).await;

        assert_eq!(store.trim(10).await.unwrap(), 2);
        let seqs: Vec<u64> = store.history(100).await.unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (3..=12).collect::<Vec<_>>());

        // Idempotent.
        assert_eq!(store.trim(10).await.unwrap(), 0);
        assert_eq!(store.history(100).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_trim_below_window_is_noop() {
        let store = filled(4).await;
        assert_eq!(store.trim(10).await.unwrap(), 0);
        assert_eq!(store.history(100).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_out_of_order_append_is_placed_by_timestamp() {
        let store = Store::new(MemoryStore::new());
        for seq in [3, 1, 2] {
            store.append(&reading(seq)).await.unwrap();
        }
        store.trim(2).await.unwrap();

        let seqs: Vec<u64> = store.history(10).await.unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
