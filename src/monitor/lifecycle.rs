//! Match lifecycle as an explicit state machine.
//!
//! ```text
//!  scheduled ──▶ live ──▶ half_time ──▶ live ──▶ finished
//!      │          │           │
//!      └──────────┴───────────┴──▶ postponed / cancelled
//! ```

use crate::db::models::MatchStatus::{self, *};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Kickoff,
    Break,
    Resume,
    FullTime,
    /// Postponed or cancelled before the end.
    Called,
    /// A postponed match was given a new date.
    Rescheduled,
    /// Not a move the lifecycle allows; treated as noise.
    Irregular,
}

const TRANSITIONS: &[(MatchStatus, MatchStatus, Transition)] = &[
    (Scheduled, Live, Transition::Kickoff),
    (Scheduled, HalfTime, Transition::Break),
    (Scheduled, Postponed, Transition::Called),
    (Scheduled, Cancelled, Transition::Called),
    (Live, HalfTime, Transition::Break),
    (Live, Finished, Transition::FullTime),
    (Live, Postponed, Transition::Called),
    (Live, Cancelled, Transition::Called),
    (HalfTime, Live, Transition::Resume),
    (HalfTime, Finished, Transition::FullTime),
    (HalfTime, Postponed, Transition::Called),
    (HalfTime, Cancelled, Transition::Called),
    (Postponed, Scheduled, Transition::Rescheduled),
    (Postponed, Live, Transition::Kickoff),
    (Postponed, Cancelled, Transition::Called),
];

/// Classify a status change. An unseen match counts as `scheduled`.
pub fn classify(from: Option<MatchStatus>, to: MatchStatus) -> Transition {
    let from = from.unwrap_or(Scheduled);
    if from == to {
        return Transition::Unchanged;
    }
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, transition)| *transition)
        .unwrap_or(Transition::Irregular)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_path() {
        assert_eq!(classify(None, Live), Transition::Kickoff);
        assert_eq!(classify(Some(Scheduled), Live), Transition::Kickoff);
        assert_eq!(classify(Some(Live), HalfTime), Transition::Break);
        assert_eq!(classify(Some(HalfTime), Live), Transition::Resume);
        assert_eq!(classify(Some(HalfTime), Finished), Transition::FullTime);
        assert_eq!(classify(Some(Live), Live), Transition::Unchanged);
    }

    #[test]
    fn test_called_off_from_any_pre_finished_state() {
        for from in [Scheduled, Live, HalfTime] {
            assert_eq!(classify(Some(from), Postponed), Transition::Called);
            assert_eq!(classify(Some(from), Cancelled), Transition::Called);
        }
        assert_eq!(classify(Some(Finished), Cancelled), Transition::Irregular);
    }

    #[test]
    fn test_irregular_moves() {
        assert_eq!(classify(Some(Finished), Live), Transition::Irregular);
        assert_eq!(classify(None, Finished), Transition::Irregular);
        assert_eq!(classify(Some(Cancelled), Scheduled), Transition::Irregular);
    }
}
