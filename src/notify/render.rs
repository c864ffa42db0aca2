use crate::db::models::{DomainEvent, EventKind};

/// Channel-independent text of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

impl RenderedMessage {
    /// Single-block form for channels without a subject line.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.subject, self.body)
    }
}

pub fn render(event: &DomainEvent) -> RenderedMessage {
    let m = &event.match_ref;
    let scoreline = format!("{} {} {}", m.home.name, event.score, m.away.name);
    let minute = event.minute.map(|n| format!(" ({}')", n)).unwrap_or_default();
    let team = event.team.as_ref().map_or("", |t| t.name.as_str());

    let (subject, mut body) = match event.kind {
        EventKind::MatchStart => (
            format!("🏁 Kick-off: {} vs {}", m.home.name, m.away.name),
            format!("{} vs {} is underway{}.", m.home.name, m.away.name, minute),
        ),
        EventKind::Goal => {
            let scorer = if event.detail.is_empty() {
                String::new()
            } else {
                format!(" by {}", event.detail)
            };
            (
                format!("⚽ GOAL! {}", scoreline),
                format!("Goal for {}{}{}.\n{}", team, scorer, minute, scoreline),
            )
        }
        EventKind::HalfTime => (
            format!("⏸ Half-time: {}", scoreline),
            format!("Half-time at {} vs {}.\n{}", m.home.name, m.away.name, scoreline),
        ),
        EventKind::MatchEnd => (
            format!("🏆 Full-time: {}", scoreline),
            event.detail.clone(),
        ),
        EventKind::PenaltyAttempt => (
            format!("🎯 Shootout: {} scores", team),
            format!("{} vs {}: {}.", m.home.name, m.away.name, event.detail),
        ),
        EventKind::ScheduleChange => (
            format!("📅 {} vs {}", m.home.name, m.away.name),
            event.detail.clone(),
        ),
    };
    if let Some(competition) = &m.competition {
        body.push_str(&format!("\n{}", competition));
    }
    RenderedMessage { subject, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MatchRef, Score, Team};

    fn event(kind: EventKind, team: Option<&str>, detail: &str) -> DomainEvent {
        let home = Team::new("42", "Arsenal");
        let away = Team::new("49", "Chelsea");
        let team = team.map(|name| if name == "Arsenal" { home.clone() } else { away.clone() });
        DomainEvent {
            kind,
            match_ref: MatchRef {
                match_id: "1035034".into(),
                home,
                away,
                competition: Some("Premier League".into()),
            },
            team,
            minute: Some(23),
            score: Score::new(1, 0),
            detail: detail.into(),
            dedup_key: "k".into(),
        }
    }

    #[test]
    fn test_goal_message() {
        let msg = render(&event(EventKind::Goal, Some("Arsenal"), "B. Saka"));
        assert_eq!(msg.subject, "⚽ GOAL! Arsenal 1-0 Chelsea");
        assert!(msg.body.starts_with("Goal for Arsenal by B. Saka (23')."));
        assert!(msg.body.ends_with("Premier League"));
    }

    #[test]
    fn test_goal_without_scorer() {
        let msg = render(&event(EventKind::Goal, Some("Chelsea"), ""));
        assert!(msg.body.starts_with("Goal for Chelsea (23')."));
    }

    #[test]
    fn test_every_kind_has_subject() {
        for kind in [
            EventKind::MatchStart,
            EventKind::Goal,
            EventKind::HalfTime,
            EventKind::MatchEnd,
            EventKind::PenaltyAttempt,
            EventKind::ScheduleChange,
        ] {
            let msg = render(&event(kind, Some("Arsenal"), "detail"));
            assert!(!msg.subject.is_empty());
            assert!(msg.text().contains(&msg.subject));
        }
    }
}
