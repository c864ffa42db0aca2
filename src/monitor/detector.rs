//! Snapshot comparison: turns two consecutive views of a match into the
//! notifications they imply.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::lifecycle::{self, Transition};
use crate::db::models::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Regulation time plus a typical allowance for stoppages and the break.
    pub expected_duration: Duration,
    /// How long a live match may stay silent past its expected end.
    pub grace: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            expected_duration: Duration::minutes(105),
            grace: Duration::minutes(30),
        }
    }
}

/// Result of one comparison.
#[derive(Debug, Clone)]
pub struct Detection {
    pub events: Vec<DomainEvent>,
    /// `current` with the recorded keys merged in (and forced to `finished`
    /// when the match went silent past its expected end).
    pub snapshot: MatchSnapshot,
}

#[derive(Debug, Clone)]
pub struct EventDetector {
    config: DetectorConfig,
}

impl EventDetector {
    pub fn new(config: DetectorConfig) -> Self {
        EventDetector { config }
    }

    /// A match still reported in play long after it should have ended, with
    /// no state change for at least the grace margin.
    pub fn is_overdue(&self, snapshot: &MatchSnapshot, now: DateTime<Utc>) -> bool {
        snapshot.status.is_in_play()
            && now >= snapshot.kickoff + self.config.expected_duration + self.config.grace
            && now - snapshot.last_updated >= self.config.grace
    }

    /// Compare `previous` (if any) with `current`. Pure: the same pair always
    /// yields the same events, and a key already in the recorded set is
    /// never emitted again.
    pub fn detect(
        &self,
        previous: Option<&MatchSnapshot>,
        current: &MatchSnapshot,
        now: DateTime<Utc>,
    ) -> Detection {
        let mut snapshot = current.clone();
        let mut recorded = std::mem::take(&mut snapshot.recorded_events);
        if let Some(prev) = previous {
            recorded.extend(prev.recorded_events.iter().cloned());
        }

        if let Some(prev) = previous {
            if prev.status == MatchStatus::Live
                && snapshot.status == MatchStatus::Live
                && snapshot.minute < prev.minute
            {
                debug!(
                    match_id = %snapshot.match_id,
                    "Minute went backwards ({:?} -> {:?}), keeping {:?}",
                    prev.minute, snapshot.minute, prev.minute
                );
                snapshot.minute = prev.minute;
            }
            // A lower score is treated as a provider glitch: no goals this
            // tick, and the last good score stays the baseline.
            if snapshot.score.home < prev.score.home || snapshot.score.away < prev.score.away {
                warn!(
                    match_id = %snapshot.match_id,
                    "Score went backwards ({} -> {}), keeping {}",
                    prev.score, snapshot.score, prev.score
                );
                snapshot.score = prev.score;
            }
        }

        let forced = self.is_overdue(&snapshot, now);
        if forced {
            warn!(
                match_id = %snapshot.match_id,
                kickoff = %snapshot.kickoff,
                last_updated = %snapshot.last_updated,
                "No final whistle reported, closing match locally"
            );
            snapshot.status = MatchStatus::Finished;
        }

        let transition = lifecycle::classify(previous.map(|p| p.status), snapshot.status);
        if transition == Transition::Irregular && !forced {
            warn!(
                match_id = %snapshot.match_id,
                from = %previous.map_or(MatchStatus::Scheduled, |p| p.status),
                to = %snapshot.status,
                "Irregular status transition, no lifecycle events"
            );
        }

        let mut out = Emitter {
            snapshot: &snapshot,
            recorded: &mut recorded,
            events: Vec::new(),
        };

        // 1. match start
        if transition == Transition::Kickoff {
            let minute = match previous {
                None => snapshot.minute.unwrap_or(0),
                Some(_) => 0,
            };
            out.push(EventKind::MatchStart, None, Some(minute), Score::default(), "", String::new());
        }

        // 2. goals
        detect_goals(previous, &mut out);

        // 3. half time
        if transition == Transition::Break {
            let detail = format!(
                "{} {} {}",
                snapshot.home.name, snapshot.score, snapshot.away.name
            );
            out.push(EventKind::HalfTime, None, snapshot.minute, snapshot.score, "", detail);
        }

        // 4. match end
        let previously_in_play = previous.map_or(forced, |p| p.status.is_in_play());
        if snapshot.status == MatchStatus::Finished
            && previously_in_play
            && (transition == Transition::FullTime || forced)
        {
            out.push(
                EventKind::MatchEnd,
                None,
                snapshot.minute,
                snapshot.score,
                "",
                match_summary(&snapshot, forced),
            );
        }

        // 5. penalty shootout
        detect_shootout(previous, &mut out);

        // 6. schedule change
        detect_schedule_change(previous, transition, &mut out);

        let events = out.events;
        snapshot.recorded_events = recorded;
        Detection { events, snapshot }
    }

    /// Informational event for a match seen for the first time by discovery.
    pub fn discovery_event(&self, snapshot: &MatchSnapshot) -> DomainEvent {
        let mut detail = format!(
            "New match found: {}, kickoff {}",
            snapshot.label(),
            snapshot.kickoff.format("%Y-%m-%d %H:%M UTC")
        );
        if let Some(competition) = &snapshot.competition {
            detail.push_str(&format!(" ({})", competition));
        }
        DomainEvent {
            kind: EventKind::ScheduleChange,
            match_ref: snapshot.match_ref(),
            team: None,
            minute: None,
            score: snapshot.score,
            detail,
            dedup_key: DomainEvent::dedup_key_for(
                &snapshot.match_id,
                EventKind::ScheduleChange,
                None,
                snapshot.score,
                "discovered",
            ),
        }
    }
}

struct Emitter<'a> {
    snapshot: &'a MatchSnapshot,
    recorded: &'a mut BTreeSet<String>,
    events: Vec<DomainEvent>,
}

impl Emitter<'_> {
    fn push(
        &mut self,
        kind: EventKind,
        side: Option<Side>,
        minute: Option<u32>,
        score: Score,
        token: &str,
        detail: String,
    ) {
        let key = DomainEvent::dedup_key_for(&self.snapshot.match_id, kind, minute, score, token);
        if !self.recorded.insert(key.clone()) {
            debug!(key = %key, "Event already recorded, suppressed");
            return;
        }
        self.events.push(DomainEvent {
            kind,
            match_ref: self.snapshot.match_ref(),
            team: side.map(|s| self.snapshot.team(s).clone()),
            minute,
            score,
            detail,
            dedup_key: key,
        });
    }
}

fn detect_goals(previous: Option<&MatchSnapshot>, out: &mut Emitter<'_>) {
    let current = out.snapshot;
    if previous.is_none() && current.status.is_terminal() {
        return;
    }
    let base = previous.map(|p| p.score).unwrap_or_default();

    let mut running = base;
    for side in [Side::Home, Side::Away] {
        let scored: Vec<&TimelineEntry> = current
            .timeline
            .iter()
            .filter(|e| e.kind.is_goal() && e.side == Some(side))
            .collect();
        for n in base.side(side) + 1..=current.score.side(side) {
            running = running.with_side(side, n);
            let entry = scored.get((n - 1) as usize).copied();
            let minute = entry.and_then(|e| e.minute).or(current.minute);
            out.push(
                EventKind::Goal,
                Some(side),
                minute,
                running,
                side.as_str(),
                entry.map(scorer_label).unwrap_or_default(),
            );
        }
    }
}

fn detect_shootout(previous: Option<&MatchSnapshot>, out: &mut Emitter<'_>) {
    let current = out.snapshot;
    let Some(shootout) = current.shootout else {
        return;
    };
    if !matches!(current.status, MatchStatus::Live | MatchStatus::Finished) {
        return;
    }
    if previous.is_none() && current.status.is_terminal() {
        return;
    }
    let base = previous.and_then(|p| p.shootout).unwrap_or_default();
    if shootout.home < base.home || shootout.away < base.away {
        warn!(
            match_id = %current.match_id,
            "Shootout score went backwards ({} -> {})",
            base, shootout
        );
        return;
    }

    let mut running = base;
    for side in [Side::Home, Side::Away] {
        let takers: Vec<&TimelineEntry> = current
            .timeline
            .iter()
            .filter(|e| e.kind == TimelineKind::ShootoutScored && e.side == Some(side))
            .collect();
        for n in base.side(side) + 1..=shootout.side(side) {
            running = running.with_side(side, n);
            let mut detail = format!("Shootout {}", running);
            if let Some(player) = takers.get((n - 1) as usize).and_then(|e| e.player.as_deref()) {
                detail.push_str(&format!(", scored by {}", player));
            }
            out.push(
                EventKind::PenaltyAttempt,
                Some(side),
                current.minute,
                running,
                side.as_str(),
                detail,
            );
        }
    }
}

fn detect_schedule_change(
    previous: Option<&MatchSnapshot>,
    transition: Transition,
    out: &mut Emitter<'_>,
) {
    let current = out.snapshot;
    let mut changes = Vec::new();
    if let Some(prev) = previous {
        if prev.kickoff != current.kickoff {
            changes.push(format!(
                "kickoff moved from {} to {}",
                prev.kickoff.format("%Y-%m-%d %H:%M UTC"),
                current.kickoff.format("%Y-%m-%d %H:%M UTC")
            ));
        }
    }
    match transition {
        Transition::Called => changes.push(format!(
            "match {} (was {})",
            current.status,
            previous.map_or(MatchStatus::Scheduled, |p| p.status)
        )),
        Transition::Rescheduled => changes.push("match rescheduled".to_string()),
        _ => {}
    }
    if changes.is_empty() {
        return;
    }

    let token = format!("{}@{}", current.status, current.kickoff.timestamp());
    out.push(
        EventKind::ScheduleChange,
        None,
        current.minute,
        current.score,
        &token,
        changes.join("; "),
    );
}

fn scorer_label(entry: &TimelineEntry) -> String {
    let Some(player) = entry.player.as_deref() else {
        return String::new();
    };
    match entry.kind {
        TimelineKind::PenaltyGoal => format!("{} (pen)", player),
        TimelineKind::OwnGoal => format!("{} (og)", player),
        _ => player.to_string(),
    }
}

fn match_summary(snapshot: &MatchSnapshot, forced: bool) -> String {
    let mut parts = vec![format!(
        "Final score {} {} {}",
        snapshot.home.name, snapshot.score, snapshot.away.name
    )];
    if let Some(shootout) = snapshot.shootout {
        parts.push(format!("penalties {}", shootout));
    }

    let scorers: Vec<String> = snapshot
        .timeline
        .iter()
        .filter(|e| e.kind.is_goal())
        .filter_map(|e| {
            let name = scorer_label(e);
            if name.is_empty() {
                return None;
            }
            Some(match e.minute {
                Some(m) => format!("{} {}'", name, m),
                None => name,
            })
        })
        .collect();
    if !scorers.is_empty() {
        parts.push(format!("goals: {}", scorers.join(", ")));
    }

    if !snapshot.timeline.is_empty() {
        let count = |kind| snapshot.timeline.iter().filter(|e| e.kind == kind).count();
        parts.push(format!(
            "cards: {} yellow, {} red",
            count(TimelineKind::YellowCard),
            count(TimelineKind::RedCard)
        ));
    }

    if forced {
        parts.push("no final whistle reported".to_string());
    }
    parts.join("; ")
}
