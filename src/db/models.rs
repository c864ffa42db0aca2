use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A football team. Configured teams come from the teams file; opponents are
/// built from provider payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub league: Option<String>,
    pub country: Option<String>,
}

impl Team {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Team {
            id: id.into(),
            name: name.into(),
            short_name: None,
            league: None,
            country: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

impl Score {
    pub fn new(home: u32, away: u32) -> Self {
        Score { home, away }
    }

    pub fn side(&self, side: Side) -> u32 {
        match side {
            Side::Home => self.home,
            Side::Away => self.away,
        }
    }

    pub fn with_side(mut self, side: Side, value: u32) -> Self {
        match side {
            Side::Home => self.home = value,
            Side::Away => self.away = value,
        }
        self
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

/// Lifecycle status of a match, normalized from provider status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    Live,
    HalfTime,
    Finished,
    Postponed,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::HalfTime => "half_time",
            MatchStatus::Finished => "finished",
            MatchStatus::Postponed => "postponed",
            MatchStatus::Cancelled => "cancelled",
        }
    }

    /// Ball in play or in the interval.
    pub fn is_in_play(self) -> bool {
        matches!(self, MatchStatus::Live | MatchStatus::HalfTime)
    }

    /// No further polling is needed once a match reaches one of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Finished | MatchStatus::Postponed | MatchStatus::Cancelled
        )
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Goal,
    OwnGoal,
    PenaltyGoal,
    MissedPenalty,
    ShootoutScored,
    ShootoutMissed,
    YellowCard,
    RedCard,
    Substitution,
    Other,
}

impl TimelineKind {
    /// Entries that move the regular scoreline.
    pub fn is_goal(self) -> bool {
        matches!(
            self,
            TimelineKind::Goal | TimelineKind::OwnGoal | TimelineKind::PenaltyGoal
        )
    }
}

/// One entry of the provider's per-match event timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub kind: TimelineKind,
    pub side: Option<Side>,
    pub minute: Option<u32>,
    pub player: Option<String>,
}

/// Point-in-time normalized view of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: String,
    pub home: Team,
    pub away: Team,
    pub competition: Option<String>,
    pub status: MatchStatus,
    pub score: Score,
    /// Elapsed minute; `None` before kickoff.
    pub minute: Option<u32>,
    /// Deduplication keys of every event already emitted for this match.
    #[serde(default)]
    pub recorded_events: BTreeSet<String>,
    pub kickoff: DateTime<Utc>,
    /// When the observable match state last changed.
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    /// Penalty-shootout score, when the provider reports one.
    #[serde(default)]
    pub shootout: Option<Score>,
}

impl MatchSnapshot {
    pub fn label(&self) -> String {
        format!("{} vs {}", self.home.name, self.away.name)
    }

    pub fn team(&self, side: Side) -> &Team {
        match side {
            Side::Home => &self.home,
            Side::Away => &self.away,
        }
    }

    /// True when nothing a notification could depend on has changed.
    pub fn same_state(&self, other: &MatchSnapshot) -> bool {
        self.status == other.status
            && self.score == other.score
            && self.minute == other.minute
            && self.kickoff == other.kickoff
            && self.shootout == other.shootout
    }

    pub fn match_ref(&self) -> MatchRef {
        MatchRef {
            match_id: self.match_id.clone(),
            home: self.home.clone(),
            away: self.away.clone(),
            competition: self.competition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRef {
    pub match_id: String,
    pub home: Team,
    pub away: Team,
    pub competition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MatchStart,
    Goal,
    HalfTime,
    MatchEnd,
    PenaltyAttempt,
    ScheduleChange,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MatchStart => "match_start",
            EventKind::Goal => "goal",
            EventKind::HalfTime => "half_time",
            EventKind::MatchEnd => "match_end",
            EventKind::PenaltyAttempt => "penalty_attempt",
            EventKind::ScheduleChange => "schedule_change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected match event, ready to be rendered and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub match_ref: MatchRef,
    /// Team the event belongs to; `None` for match-level events.
    pub team: Option<Team>,
    pub minute: Option<u32>,
    /// Score after the event.
    pub score: Score,
    /// Scorer name, statistics or schedule details.
    pub detail: String,
    pub dedup_key: String,
}

impl DomainEvent {
    /// Deterministic key over (match, kind, minute, score, detail token).
    ///
    /// `token` is the stable part of the detail (scoring side, shootout
    /// score, new kickoff), never free text that may be enriched later.
    pub fn dedup_key_for(
        match_id: &str,
        kind: EventKind,
        minute: Option<u32>,
        score: Score,
        token: &str,
    ) -> String {
        let minute = minute.map_or_else(|| "-".to_string(), |m| m.to_string());
        format!("{}:{}:{}:{}:{}", match_id, kind, minute, score, token)
    }
}
