use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::{Pipeline, PollOutcome};
use super::store::SnapshotStore;
use crate::db::models::{MatchSnapshot, MatchStatus, Team};
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Known fixture, kickoff still some way off.
    Discovery,
    /// Around kickoff or in play.
    Active,
    /// Over or called off; kept only until purged.
    Idle,
}

#[derive(Debug, Clone)]
pub struct PollTarget {
    pub match_id: String,
    pub tier: Tier,
    pub next_due: DateTime<Utc>,
    pub kickoff: DateTime<Utc>,
    pub in_flight: bool,
    pub idle_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub frequency_normal: Duration,
    pub frequency_during_match: Duration,
    pub kickoff_lead: Duration,
    pub discovery_days: u32,
    pub retention: Duration,
    pub tick_interval: std::time::Duration,
    pub discovery_interval: std::time::Duration,
    /// How long shutdown waits for running polls to finish delivering.
    pub shutdown_grace: std::time::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            frequency_normal: Duration::seconds(300),
            frequency_during_match: Duration::seconds(60),
            kickoff_lead: Duration::minutes(5),
            discovery_days: 3,
            retention: Duration::days(7),
            tick_interval: std::time::Duration::from_secs(5),
            discovery_interval: std::time::Duration::from_secs(300),
            shutdown_grace: std::time::Duration::from_secs(30),
        }
    }
}

type PollResult = (String, Result<PollOutcome, FetchError>);
type DiscoveryTasks = JoinSet<Result<Vec<MatchSnapshot>, FetchError>>;

/// Owns every poll target and decides what runs when. Pipelines run as
/// separate tasks; a match is never polled twice at once.
pub struct Scheduler {
    settings: SchedulerSettings,
    teams: Vec<Team>,
    pipeline: Arc<Pipeline>,
    store: Arc<SnapshotStore>,
    targets: HashMap<String, PollTarget>,
    running: JoinSet<PollResult>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        teams: Vec<Team>,
        pipeline: Arc<Pipeline>,
        store: Arc<SnapshotStore>,
    ) -> Self {
        Scheduler {
            settings,
            teams,
            pipeline,
            store,
            targets: HashMap::new(),
            running: JoinSet::new(),
        }
    }

    pub fn target(&self, match_id: &str) -> Option<&PollTarget> {
        self.targets.get(match_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Rebuild targets from persisted snapshots.
    pub fn restore(&mut self, snapshots: &[MatchSnapshot], now: DateTime<Utc>) {
        for snapshot in snapshots {
            let target = self.new_target(snapshot, now);
            debug!(match_id = %target.match_id, tier = ?target.tier, "Target restored");
            self.targets.insert(snapshot.match_id.clone(), target);
        }
        if !snapshots.is_empty() {
            info!(targets = self.targets.len(), "Restored poll targets from database");
        }
    }

    /// Query fixtures for every team and start tracking new ones.
    pub async fn discover_matches(&mut self, now: DateTime<Utc>) -> Result<usize, FetchError> {
        let fixtures = self
            .pipeline
            .discover(&self.teams, now, self.settings.discovery_days)
            .await?;
        Ok(self.track(fixtures, now))
    }

    /// Add targets for untracked fixtures and wake idle ones that came back
    /// to life. Returns the number of new targets.
    pub fn track(&mut self, fixtures: Vec<MatchSnapshot>, now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for snapshot in fixtures {
            if now >= snapshot.kickoff + self.settings.retention {
                continue;
            }
            match self.targets.get_mut(&snapshot.match_id) {
                None => {
                    let target = self.new_target(&snapshot, now);
                    info!(
                        match_id = %target.match_id,
                        tier = ?target.tier,
                        kickoff = %target.kickoff,
                        "Tracking match"
                    );
                    self.targets.insert(snapshot.match_id.clone(), target);
                    added += 1;
                }
                Some(target) if target.tier == Tier::Idle && !snapshot.status.is_terminal() => {
                    target.kickoff = snapshot.kickoff;
                    target.next_due = now;
                    set_tier(target, Tier::Discovery, now, "fixture active again");
                }
                Some(_) => {}
            }
        }
        added
    }

    /// Launch the pipeline for every target that is due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        self.purge_expired(now);

        let lead = self.settings.kickoff_lead;
        let mut due = Vec::new();
        for target in self.targets.values_mut() {
            if target.tier == Tier::Discovery && now >= target.kickoff - lead {
                set_tier(target, Tier::Active, now, "kickoff approaching");
                target.next_due = target.next_due.min(now);
            }
            if target.tier != Tier::Idle && !target.in_flight && target.next_due <= now {
                target.in_flight = true;
                due.push(target.match_id.clone());
            }
        }

        let launched = due.len();
        for match_id in due {
            let pipeline = self.pipeline.clone();
            self.running.spawn(async move {
                let outcome = pipeline.poll_match(&match_id, now).await;
                (match_id, outcome)
            });
        }
        launched
    }

    /// Apply the result of one finished pipeline run.
    pub fn complete(
        &mut self,
        match_id: &str,
        result: Result<PollOutcome, FetchError>,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let Some(target) = self.targets.get_mut(match_id) else {
            return Ok(());
        };
        target.in_flight = false;

        match result {
            Ok(outcome) => {
                debug!(match_id = %match_id, status = %outcome.status, events = outcome.events, "Poll complete");
                target.kickoff = outcome.kickoff;
                let tier = next_tier(outcome.status, outcome.kickoff, now, self.settings.kickoff_lead);
                if tier != target.tier {
                    set_tier(target, tier, now, outcome.status.as_str());
                }
                target.next_due = now + poll_interval(&self.settings, tier);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(match_id = %match_id, error = %e, "Schema violation, stopping");
                Err(e)
            }
            Err(FetchError::Cancelled) => Ok(()),
            Err(e) => {
                warn!(match_id = %match_id, error = %e, "Poll failed, retrying next tick");
                Ok(())
            }
        }
    }

    /// Wait for every running pipeline and apply its result.
    pub async fn drain(&mut self, now: DateTime<Utc>) -> Result<(), FetchError> {
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok((match_id, result)) => self.complete(&match_id, result, now)?,
                Err(e) => error!("Pipeline task failed: {}", e),
            }
        }
        Ok(())
    }

    /// Coordinating loop. Returns on shutdown, or with an error when the
    /// provider breaks its response schema.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovery = tokio::time::interval(self.settings.discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovering = DiscoveryTasks::new();

        info!(
            teams = self.teams.len(),
            targets = self.targets.len(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(in_flight = self.running.len(), "Scheduler stopping");
                    self.wind_down(&mut discovering).await;
                    return Ok(());
                }
                _ = discovery.tick() => {
                    if discovering.is_empty() {
                        let pipeline = self.pipeline.clone();
                        let teams = self.teams.clone();
                        let days = self.settings.discovery_days;
                        discovering.spawn(async move {
                            pipeline.discover(&teams, Utc::now(), days).await
                        });
                    }
                }
                Some(joined) = discovering.join_next() => {
                    match joined {
                        Ok(Ok(fixtures)) => {
                            let added = self.track(fixtures, Utc::now());
                            debug!(added, targets = self.targets.len(), "Discovery finished");
                        }
                        Ok(Err(e)) if e.is_fatal() => {
                            error!(error = %e, "Schema violation during discovery, stopping");
                            self.wind_down(&mut discovering).await;
                            return Err(e.into());
                        }
                        Ok(Err(e)) => warn!(error = %e, "Discovery failed"),
                        Err(e) => error!("Discovery task failed: {}", e),
                    }
                }
                _ = tick.tick() => {
                    self.tick(Utc::now());
                }
                Some(joined) = self.running.join_next() => {
                    match joined {
                        Ok((match_id, result)) => {
                            if let Err(e) = self.complete(&match_id, result, Utc::now()) {
                                self.wind_down(&mut discovering).await;
                                return Err(e.into());
                            }
                        }
                        Err(e) => error!("Pipeline task failed: {}", e),
                    }
                }
            }
        }
    }

    /// Let running polls and discovery finish delivering what they already
    /// recorded, for up to the shutdown grace. Anything still running after
    /// that is aborted.
    async fn wind_down(&mut self, discovering: &mut DiscoveryTasks) {
        let running = &mut self.running;
        let finished = tokio::time::timeout(self.settings.shutdown_grace, async {
            while discovering.join_next().await.is_some() {}
            while running.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(
                polls = self.running.len(),
                discoveries = discovering.len(),
                "Shutdown grace elapsed, aborting unfinished work"
            );
            self.running.shutdown().await;
            discovering.shutdown().await;
        }
    }

    fn new_target(&self, snapshot: &MatchSnapshot, now: DateTime<Utc>) -> PollTarget {
        let terminal = snapshot.status.is_terminal();
        PollTarget {
            match_id: snapshot.match_id.clone(),
            tier: if terminal { Tier::Idle } else { Tier::Discovery },
            next_due: now,
            kickoff: snapshot.kickoff,
            in_flight: false,
            idle_since: terminal.then_some(now),
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let retention = self.settings.retention;
        let expired: Vec<String> = self
            .targets
            .values()
            .filter(|t| !t.in_flight && now >= t.kickoff + retention)
            .map(|t| t.match_id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for match_id in expired {
            if let Some(target) = self.targets.remove(&match_id) {
                info!(match_id = %match_id, tier = ?target.tier, "Match purged after retention window");
            }
            self.store.remove(&match_id);
        }
        self.pipeline.prune_deliveries(now - retention);
    }
}

fn poll_interval(settings: &SchedulerSettings, tier: Tier) -> Duration {
    match tier {
        Tier::Active => settings.frequency_during_match,
        Tier::Discovery | Tier::Idle => settings.frequency_normal,
    }
}

fn next_tier(status: MatchStatus, kickoff: DateTime<Utc>, now: DateTime<Utc>, lead: Duration) -> Tier {
    if status.is_terminal() {
        Tier::Idle
    } else if status.is_in_play() || now >= kickoff - lead {
        Tier::Active
    } else {
        Tier::Discovery
    }
}

fn set_tier(target: &mut PollTarget, tier: Tier, now: DateTime<Utc>, reason: &str) {
    info!(
        match_id = %target.match_id,
        from = ?target.tier,
        to = ?tier,
        reason,
        "Tier transition"
    );
    target.tier = tier;
    target.idle_since = (tier == Tier::Idle).then_some(now);
}
