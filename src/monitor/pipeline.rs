use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::detector::EventDetector;
use super::store::SnapshotStore;
use crate::db::models::{DomainEvent, MatchSnapshot, MatchStatus, Team};
use crate::error::FetchError;
use crate::live_scores::MatchFeed;
use crate::notify::Dispatcher;

/// What the scheduler needs to know after a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status: MatchStatus,
    pub kickoff: DateTime<Utc>,
    pub events: usize,
}

impl PollOutcome {
    fn new(snapshot: &MatchSnapshot, events: usize) -> Self {
        PollOutcome {
            status: snapshot.status,
            kickoff: snapshot.kickoff,
            events,
        }
    }
}

/// fetch → detect → dispatch for one match at a time.
pub struct Pipeline {
    feed: MatchFeed,
    store: Arc<SnapshotStore>,
    detector: EventDetector,
    dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    pub fn new(
        feed: MatchFeed,
        store: Arc<SnapshotStore>,
        detector: EventDetector,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Pipeline {
            feed,
            store,
            detector,
            dispatcher,
        }
    }

    /// Poll one match. When the provider cannot be reached the stored
    /// snapshot is still checked for an overdue end.
    pub async fn poll_match(&self, match_id: &str, now: DateTime<Utc>) -> Result<PollOutcome, FetchError> {
        match self.refresh(match_id, now).await {
            Err(e) if !e.is_fatal() && !matches!(e, FetchError::Cancelled) => {
                match self.store.expire_if_overdue(match_id, &self.detector, now).await {
                    Some((events, snapshot)) => {
                        self.deliver(&events).await;
                        Ok(PollOutcome::new(&snapshot, events.len()))
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn refresh(&self, match_id: &str, now: DateTime<Utc>) -> Result<PollOutcome, FetchError> {
        let mut current = self.feed.live_match(match_id).await?;
        let previous = self.store.latest(match_id).await;
        self.attach_timeline(previous.as_ref(), &mut current).await?;

        let (events, stored) = self.store.apply(current, &self.detector, now).await;
        debug!(
            match_id = %match_id,
            status = %stored.status,
            score = %stored.score,
            events = events.len(),
            "Match polled"
        );
        self.deliver(&events).await;
        Ok(PollOutcome::new(&stored, events.len()))
    }

    async fn attach_timeline(
        &self,
        previous: Option<&MatchSnapshot>,
        current: &mut MatchSnapshot,
    ) -> Result<(), FetchError> {
        if !needs_timeline(previous, current) {
            return Ok(());
        }
        match self.feed.timeline(current).await {
            Ok(timeline) => current.timeline = timeline,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(
                match_id = %current.match_id,
                error = %e,
                "Timeline unavailable, reporting without scorers"
            ),
        }
        Ok(())
    }

    /// Fixtures of every team within `[today, today + days]`. New ones are
    /// seeded into the store and announced. A failing team is skipped.
    pub async fn discover(
        &self,
        teams: &[Team],
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<Vec<MatchSnapshot>, FetchError> {
        let today = now.date_naive();
        let to = today + Duration::days(i64::from(days));
        let results = join_all(teams.iter().map(|team| async move {
            (team, self.feed.fixtures(&team.id, today, to).await)
        }))
        .await;

        let mut found = BTreeMap::new();
        for (team, result) in results {
            match result {
                Ok(fixtures) => {
                    for snapshot in fixtures {
                        found.entry(snapshot.match_id.clone()).or_insert(snapshot);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(team = %team.name, error = %e, "Fixture discovery failed"),
            }
        }

        for snapshot in found.values() {
            if self.store.contains(&snapshot.match_id) {
                continue;
            }
            let announcement = self.detector.discovery_event(snapshot);
            if snapshot.status.is_in_play() {
                self.discover_in_play(snapshot.clone(), announcement, now).await?;
                continue;
            }
            let mut baseline = snapshot.clone();
            baseline.last_updated = now;
            if self
                .store
                .seed(baseline, &[announcement.dedup_key.as_str()])
                .await
            {
                log_discovered(snapshot);
                if !snapshot.status.is_terminal() {
                    self.deliver(std::slice::from_ref(&announcement)).await;
                }
            }
        }
        Ok(found.into_values().collect())
    }

    /// A match already underway when first seen is run through the detector
    /// with no previous snapshot, so its kick-off and goals so far go out.
    async fn discover_in_play(
        &self,
        mut current: MatchSnapshot,
        announcement: DomainEvent,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        log_discovered(&current);
        self.attach_timeline(None, &mut current).await?;
        current.recorded_events.insert(announcement.dedup_key.clone());
        let (events, _) = self.store.apply(current, &self.detector, now).await;
        self.deliver(std::slice::from_ref(&announcement)).await;
        self.deliver(&events).await;
        Ok(())
    }

    /// Drop delivery records older than `before`.
    pub fn prune_deliveries(&self, before: DateTime<Utc>) -> usize {
        self.dispatcher.prune(before)
    }

    /// Events of one match go out in detection order.
    async fn deliver(&self, events: &[DomainEvent]) {
        for event in events {
            info!(
                match_id = %event.match_ref.match_id,
                kind = %event.kind,
                minute = ?event.minute,
                score = %event.score,
                key = %event.dedup_key,
                "Match event: {}", event.detail
            );
            let result = self.dispatcher.dispatch(event).await;
            debug!(key = %event.dedup_key, ?result, "Dispatch finished");
        }
    }
}

fn log_discovered(snapshot: &MatchSnapshot) {
    info!(
        match_id = %snapshot.match_id,
        kickoff = %snapshot.kickoff,
        status = %snapshot.status,
        "New match discovered: {}", snapshot.label()
    );
}

fn needs_timeline(previous: Option<&MatchSnapshot>, current: &MatchSnapshot) -> bool {
    let score_changed = previous.map_or(current.score.home + current.score.away > 0, |p| {
        p.score != current.score
    });
    let just_finished = current.status == MatchStatus::Finished
        && previous.map_or(false, |p| p.status != MatchStatus::Finished);
    let shootout_changed = current.shootout.is_some()
        && previous.and_then(|p| p.shootout) != current.shootout;
    score_changed || just_finished || shootout_changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::detector::tests::snap;
    use crate::db::models::Score;

    #[test]
    fn test_needs_timeline() {
        let live = snap(MatchStatus::Live, 0, 0, Some(10));
        let scored = snap(MatchStatus::Live, 1, 0, Some(12));
        let over = snap(MatchStatus::Finished, 1, 0, Some(90));

        assert!(!needs_timeline(Some(&live), &live));
        assert!(needs_timeline(Some(&live), &scored));
        assert!(needs_timeline(Some(&scored), &over));
        assert!(!needs_timeline(Some(&over), &over));
        assert!(!needs_timeline(None, &live));

        let mut shootout = scored.clone();
        shootout.shootout = Some(Score::new(1, 0));
        assert!(needs_timeline(Some(&scored), &shootout));
    }
}
