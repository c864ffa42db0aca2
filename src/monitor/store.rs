use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use super::detector::EventDetector;
use crate::db::models::{DomainEvent, MatchSnapshot, MatchStatus};
use crate::db::Database;

#[derive(Debug, Default)]
struct MatchEntry {
    latest: Option<MatchSnapshot>,
}

/// Latest snapshot per match, sharded by match id. Each entry has its own
/// async lock, held only while detecting and updating in memory.
pub struct SnapshotStore {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<MatchEntry>>>>,
    db: Option<Database>,
}

impl SnapshotStore {
    pub fn new(db: Option<Database>) -> Self {
        SnapshotStore {
            entries: Mutex::new(HashMap::new()),
            db,
        }
    }

    fn slot(&self, match_id: &str) -> Arc<tokio::sync::Mutex<MatchEntry>> {
        self.entries
            .lock()
            .entry(match_id.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, match_id: &str) -> Option<Arc<tokio::sync::Mutex<MatchEntry>>> {
        self.entries.lock().get(match_id).cloned()
    }

    /// Load persisted snapshots at startup.
    pub fn restore(&self, snapshots: Vec<MatchSnapshot>) {
        let mut entries = self.entries.lock();
        for snapshot in snapshots {
            entries.insert(
                snapshot.match_id.clone(),
                Arc::new(tokio::sync::Mutex::new(MatchEntry {
                    latest: Some(snapshot),
                })),
            );
        }
    }

    pub fn contains(&self, match_id: &str) -> bool {
        self.entries.lock().contains_key(match_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub async fn latest(&self, match_id: &str) -> Option<MatchSnapshot> {
        let slot = self.existing(match_id)?;
        let entry = slot.lock().await;
        entry.latest.clone()
    }

    /// Store a baseline snapshot for a match seen for the first time.
    /// Returns `false` (and changes nothing) when the match is already known.
    /// `announced` keys are recorded so they are never emitted again.
    pub async fn seed(&self, mut snapshot: MatchSnapshot, announced: &[&str]) -> bool {
        let slot = self.slot(&snapshot.match_id);
        let mut entry = slot.lock().await;
        if entry.latest.is_some() {
            return false;
        }
        snapshot
            .recorded_events
            .extend(announced.iter().map(|k| k.to_string()));
        self.persist(&snapshot);
        entry.latest = Some(snapshot);
        true
    }

    /// Compare a freshly fetched snapshot with the stored one, store the
    /// result and return the events it implies.
    pub async fn apply(
        &self,
        mut current: MatchSnapshot,
        detector: &EventDetector,
        now: DateTime<Utc>,
    ) -> (Vec<DomainEvent>, MatchSnapshot) {
        let slot = self.slot(&current.match_id);
        let mut entry = slot.lock().await;
        normalize(entry.latest.as_ref(), &mut current, now);
        let detection = detector.detect(entry.latest.as_ref(), &current, now);
        self.persist(&detection.snapshot);
        entry.latest = Some(detection.snapshot.clone());
        (detection.events, detection.snapshot)
    }

    /// Run the overdue-match check against the stored snapshot alone, used
    /// when the provider could not be reached.
    pub async fn expire_if_overdue(
        &self,
        match_id: &str,
        detector: &EventDetector,
        now: DateTime<Utc>,
    ) -> Option<(Vec<DomainEvent>, MatchSnapshot)> {
        let slot = self.existing(match_id)?;
        let mut entry = slot.lock().await;
        let latest = entry.latest.as_ref()?;
        if !detector.is_overdue(latest, now) {
            return None;
        }
        let detection = detector.detect(Some(latest), latest, now);
        self.persist(&detection.snapshot);
        entry.latest = Some(detection.snapshot.clone());
        Some((detection.events, detection.snapshot))
    }

    pub fn remove(&self, match_id: &str) {
        self.entries.lock().remove(match_id);
        if let Some(db) = &self.db {
            if let Err(e) = db.delete_snapshot(match_id) {
                warn!(match_id = %match_id, "Failed to delete stored snapshot: {:#}", e);
            }
        }
    }

    fn persist(&self, snapshot: &MatchSnapshot) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_snapshot(snapshot) {
                error!(match_id = %snapshot.match_id, "Failed to persist snapshot: {:#}", e);
            }
        }
    }
}

/// Carry forward what the provider does not repeat on every poll.
fn normalize(previous: Option<&MatchSnapshot>, current: &mut MatchSnapshot, now: DateTime<Utc>) {
    let Some(prev) = previous else {
        current.last_updated = now;
        return;
    };
    if current.timeline.is_empty() {
        current.timeline = prev.timeline.clone();
    }
    if current.shootout.is_none() {
        current.shootout = prev.shootout;
    }
    // Finished is final, whether reported or closed locally.
    if prev.status == MatchStatus::Finished && current.status.is_in_play() {
        current.status = MatchStatus::Finished;
    }
    current.last_updated = if prev.same_state(current) {
        prev.last_updated
    } else {
        now
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventKind, Score};
    use crate::monitor::detector::tests::{kickoff, snap};
    use crate::monitor::detector::DetectorConfig;
    use chrono::Duration;

    fn detector() -> EventDetector {
        EventDetector::new(DetectorConfig::default())
    }

    #[tokio::test]
    async fn test_apply_tracks_last_change() {
        let store = SnapshotStore::new(None);
        let d = detector();
        let t1 = kickoff() + Duration::minutes(10);
        let t2 = kickoff() + Duration::minutes(11);

        let (events, stored) = store.apply(snap(MatchStatus::Live, 0, 0, Some(10)), &d, t1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(stored.last_updated, t1);

        // Unchanged payload keeps the earlier change time.
        let (events, stored) = store.apply(snap(MatchStatus::Live, 0, 0, Some(10)), &d, t2).await;
        assert!(events.is_empty());
        assert_eq!(stored.last_updated, t1);

        let (events, stored) = store.apply(snap(MatchStatus::Live, 1, 0, Some(11)), &d, t2).await;
        assert_eq!(events[0].kind, EventKind::Goal);
        assert_eq!(stored.last_updated, t2);
    }

    #[tokio::test]
    async fn test_score_glitch_keeps_last_good_score() {
        let store = SnapshotStore::new(None);
        let d = detector();
        let t = |m| kickoff() + Duration::minutes(m);

        store.apply(snap(MatchStatus::Live, 0, 0, Some(10)), &d, t(10)).await;
        let (events, _) = store.apply(snap(MatchStatus::Live, 1, 0, Some(23)), &d, t(23)).await;
        assert_eq!(events.len(), 1);

        let (events, stored) = store.apply(snap(MatchStatus::Live, 0, 0, Some(30)), &d, t(30)).await;
        assert!(events.is_empty());
        assert_eq!(stored.score, Score::new(1, 0));

        let (events, _) = store.apply(snap(MatchStatus::Live, 1, 0, Some(31)), &d, t(31)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_seed_is_baseline() {
        let store = SnapshotStore::new(None);
        let s = snap(MatchStatus::Scheduled, 0, 0, None);
        assert!(store.seed(s.clone(), &["k"]).await);
        assert!(!store.seed(s, &[]).await);
        let latest = store.latest("1035034").await.unwrap();
        assert!(latest.recorded_events.contains("k"));
    }

    #[tokio::test]
    async fn test_restore_from_database_survives_restart() {
        let db = Database::open_in_memory().unwrap();
        let d = detector();
        let t = kickoff() + Duration::minutes(30);
        {
            let store = SnapshotStore::new(Some(db.clone()));
            let (events, _) = store.apply(snap(MatchStatus::Live, 1, 0, Some(30)), &d, t).await;
            assert_eq!(events.len(), 2);
        }

        let store = SnapshotStore::new(Some(db.clone()));
        store.restore(db.load_snapshots().unwrap());
        assert_eq!(store.len(), 1);
        let (events, _) = store.apply(snap(MatchStatus::Live, 1, 0, Some(31)), &d, t).await;
        assert!(events.is_empty());

        store.remove("1035034");
        assert!(db.load_snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_if_overdue() {
        let store = SnapshotStore::new(None);
        let d = detector();
        let t = kickoff() + Duration::minutes(90);
        store.apply(snap(MatchStatus::Live, 2, 1, Some(90)), &d, t).await;

        assert!(store.expire_if_overdue("1035034", &d, t + Duration::minutes(10)).await.is_none());

        let late = t + Duration::minutes(60);
        let (events, stored) = store.expire_if_overdue("1035034", &d, late).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MatchEnd);
        assert_eq!(events[0].score, Score::new(2, 1));
        assert_eq!(stored.status, MatchStatus::Finished);
        assert!(store.expire_if_overdue("1035034", &d, late).await.is_none());

        // A late "still live" report does not reopen the match.
        let (events, stored) = store.apply(snap(MatchStatus::Live, 2, 1, Some(90)), &d, late).await;
        assert!(events.is_empty());
        assert_eq!(stored.status, MatchStatus::Finished);
    }
}
