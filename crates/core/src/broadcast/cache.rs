use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const SECS_PER_HOUR: u64 = 60 * 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let Ok(delta) = chrono::Duration::from_std(by) else {
            return;
        };
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = now.checked_add_signed(delta) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryRecord {
    pub recipient_id: String,
    pub message_kind: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub entries: Vec<DeliveryRecord>,
}

type CacheKey = (String, String);

/// Process-local record of which recipients already received which message
/// kind. Suppression state does not survive a restart.
pub struct DeliveryCache {
    records: Mutex<HashMap<CacheKey, DeliveryRecord>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for DeliveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, Arc::new(SystemClock))
    }
}

impl DeliveryCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { records: Mutex::new(HashMap::new()), ttl, clock }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True when no live record exists. An expired record found here is
    /// dropped on the spot.
    pub fn can_send(&self, recipient_id: &str, message_kind: &str) -> bool {
        let now = self.clock.now();
        let key = cache_key(recipient_id, message_kind);
        let mut records = self.records();

        let Some(record) = records.get(&key) else {
            return true;
        };

        let age = age_of(record, now);
        if age >= self.ttl {
            records.remove(&key);
            return true;
        }

        let remaining_hours = (self.ttl - age).as_secs().div_ceil(SECS_PER_HOUR);
        debug!(
            event_name = "broadcast.cache.suppressed",
            recipient_id,
            message_kind,
            remaining_hours,
            "recipient already received this message kind; blocking send"
        );
        false
    }

    pub fn mark_sent(&self, recipient_id: &str, message_kind: &str) {
        let record = DeliveryRecord {
            recipient_id: recipient_id.to_owned(),
            message_kind: message_kind.to_owned(),
            sent_at: self.clock.now(),
        };
        self.records().insert(cache_key(recipient_id, message_kind), record);
        debug!(
            event_name = "broadcast.cache.marked",
            recipient_id, message_kind, "message kind marked as sent"
        );
    }

    /// Removes one record, or every record for the recipient when
    /// `message_kind` is `None`. Returns how many were removed.
    pub fn clear(&self, recipient_id: &str, message_kind: Option<&str>) -> usize {
        let mut records = self.records();
        let removed = match message_kind {
            Some(kind) => usize::from(records.remove(&cache_key(recipient_id, kind)).is_some()),
            None => {
                let before = records.len();
                records.retain(|(recipient, _), _| recipient != recipient_id);
                before - records.len()
            }
        };
        debug!(event_name = "broadcast.cache.cleared", recipient_id, removed, "cache entries cleared");
        removed
    }

    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| age_of(record, now) < self.ttl);
        let swept = before - records.len();

        if swept > 0 {
            debug!(event_name = "broadcast.cache.swept", swept, "expired cache entries removed");
        }
        swept
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries = self.records().values().cloned().collect::<Vec<_>>();
        entries.sort_by(|left, right| {
            left.sent_at
                .cmp(&right.sent_at)
                .then_with(|| left.recipient_id.cmp(&right.recipient_id))
                .then_with(|| left.message_kind.cmp(&right.message_kind))
        });
        CacheStats { size: entries.len(), entries }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> MutexGuard<'_, HashMap<CacheKey, DeliveryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs [`DeliveryCache::sweep_expired`] every `every` until `shutdown` fires,
/// so memory stays bounded even without read traffic.
pub fn spawn_sweeper(
    cache: Arc<DeliveryCache>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    info!(
        event_name = "broadcast.cache.sweeper_started",
        interval_secs = every.as_secs(),
        "starting periodic delivery cache sweep"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick resolves immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(event_name = "broadcast.cache.sweeper_stopped", "delivery cache sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    cache.sweep_expired();
                }
            }
        }
    })
}

fn cache_key(recipient_id: &str, message_kind: &str) -> CacheKey {
    (recipient_id.to_owned(), message_kind.to_owned())
}

fn age_of(record: &DeliveryRecord, now: DateTime<Utc>) -> Duration {
    // a clock that moved backwards yields a zero age
    now.signed_duration_since(record.sent_at).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::{spawn_sweeper, DeliveryCache, ManualClock, DEFAULT_TTL};

    fn cache_with_clock() -> (DeliveryCache, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid start");
        let clock = Arc::new(ManualClock::new(start));
        (DeliveryCache::new(DEFAULT_TTL, clock.clone()), clock)
    }

    #[test]
    fn mark_sent_blocks_until_ttl_elapses() {
        let (cache, clock) = cache_with_clock();
        assert!(cache.can_send("U1", "welcome"));

        cache.mark_sent("U1", "welcome");
        assert!(!cache.can_send("U1", "welcome"));

        clock.advance(DEFAULT_TTL - Duration::from_secs(1));
        assert!(!cache.can_send("U1", "welcome"));

        clock.advance(Duration::from_secs(1));
        assert!(cache.can_send("U1", "welcome"));
        assert!(cache.is_empty(), "expired record should be dropped lazily");
    }

    #[test]
    fn message_kinds_are_tracked_independently() {
        let (cache, _clock) = cache_with_clock();
        cache.mark_sent("U1", "welcome");

        assert!(!cache.can_send("U1", "welcome"));
        assert!(cache.can_send("U1", "reminder"));
        assert!(cache.can_send("U2", "welcome"));
    }

    #[test]
    fn marking_again_overwrites_the_timestamp() {
        let (cache, clock) = cache_with_clock();
        cache.mark_sent("U1", "welcome");
        clock.advance(Duration::from_secs(20 * 60 * 60));
        cache.mark_sent("U1", "welcome");

        assert_eq!(cache.len(), 1);
        clock.advance(Duration::from_secs(10 * 60 * 60));
        assert!(!cache.can_send("U1", "welcome"), "refreshed record is still live");
    }

    #[test]
    fn clear_removes_one_kind_or_all_kinds_for_recipient() {
        let (cache, _clock) = cache_with_clock();
        cache.mark_sent("U1", "welcome");
        cache.mark_sent("U1", "reminder");
        cache.mark_sent("U2", "welcome");

        assert_eq!(cache.clear("U1", Some("welcome")), 1);
        assert!(cache.can_send("U1", "welcome"));
        assert!(!cache.can_send("U1", "reminder"));

        cache.mark_sent("U1", "welcome");
        assert_eq!(cache.clear("U1", None), 2);
        assert_eq!(cache.len(), 1);
        assert!(!cache.can_send("U2", "welcome"));
    }

    #[test]
    fn sweep_removes_only_expired_records() {
        let (cache, clock) = cache_with_clock();
        cache.mark_sent("U1", "welcome");
        clock.advance(Duration::from_secs(12 * 60 * 60));
        cache.mark_sent("U2", "welcome");
        clock.advance(Duration::from_secs(12 * 60 * 60));

        assert_eq!(cache.sweep_expired(), 1);
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.entries[0].recipient_id, "U2");
    }

    #[test]
    fn stats_lists_entries_oldest_first() {
        let (cache, clock) = cache_with_clock();
        cache.mark_sent("U2", "welcome");
        clock.advance(Duration::from_secs(60));
        cache.mark_sent("U1", "welcome");

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        let order = stats.entries.iter().map(|entry| entry.recipient_id.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["U2", "U1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_on_interval_and_stops_on_shutdown() {
        let (cache, clock) = cache_with_clock();
        let cache = Arc::new(cache);
        cache.mark_sent("U1", "welcome");
        clock.advance(DEFAULT_TTL);

        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(cache.clone(), Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty(), "sweeper should purge without any reads");

        shutdown.cancel();
        handle.await.expect("sweeper task should exit cleanly");
    }
}
