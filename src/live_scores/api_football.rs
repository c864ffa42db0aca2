use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::provider::{FetchRequest, MatchDataProvider, PayloadDecoder};
use crate::db::models::{
    MatchSnapshot, MatchStatus, Score, Side, Team, TimelineEntry, TimelineKind,
};
use crate::error::ProviderError;

/// Extracts a penalty-shootout score from one fixture object, if the payload
/// carries one. Pluggable because the indicator is provider specific. A value
/// that is present but malformed is an error.
pub type ShootoutProbe = Arc<dyn Fn(&Value) -> Result<Option<Score>, String> + Send + Sync>;

/// Match-data provider backed by API-Football (v3, via RapidAPI).
/// Docs: <https://www.api-football.com/documentation-v3>
pub struct ApiFootball {
    http: Client,
    api_key: String,
    host: String,
    base_url: Url,
}

impl ApiFootball {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid provider base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Provider base URL cannot carry a path: {}", base_url);
        }
        let host = base_url.host_str().unwrap_or_default().to_string();
        Ok(ApiFootball {
            http,
            api_key: api_key.to_string(),
            host,
            base_url,
        })
    }

    fn url_for(&self, request: &FetchRequest) -> Url {
        let (path, params): (&str, Vec<(&str, String)>) = match request {
            FetchRequest::Fixtures { team_id, from, to } => (
                "fixtures",
                vec![
                    ("team", team_id.clone()),
                    ("from", from.format("%Y-%m-%d").to_string()),
                    ("to", to.format("%Y-%m-%d").to_string()),
                    ("timezone", "UTC".to_string()),
                ],
            ),
            FetchRequest::LiveMatch { match_id } => ("fixtures", vec![("id", match_id.clone())]),
            FetchRequest::MatchEvents { match_id } => {
                ("fixtures/events", vec![("fixture", match_id.clone())])
            }
        };

        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.split('/'));
        }
        url.query_pairs_mut().extend_pairs(params);
        url
    }
}

#[async_trait]
impl MatchDataProvider for ApiFootball {
    fn name(&self) -> &str {
        "API-Football"
    }

    async fn execute(&self, request: &FetchRequest) -> Result<Value, ProviderError> {
        let url = self.url_for(request);
        debug!("Requesting {}", url);

        let resp = self
            .http
            .get(url)
            .header("X-RapidAPI-Key", &self.api_key)
            .header("X-RapidAPI-Host", &self.host)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                retry_after,
                message,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let raw: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        check_body_errors(&raw)?;
        Ok(raw)
    }
}

/// API-Football reports some failures with HTTP 200 and an `errors` member.
fn check_body_errors(raw: &Value) -> Result<(), ProviderError> {
    let errors = match raw.get("errors") {
        Some(Value::Object(map)) if !map.is_empty() => map,
        Some(Value::Array(items)) if !items.is_empty() => {
            return Err(ProviderError::Status {
                status: 400,
                retry_after: None,
                message: Value::Array(items.clone()).to_string(),
            })
        }
        _ => return Ok(()),
    };

    let message = errors
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join(", ");
    let status = if errors.contains_key("rateLimit") { 429 } else { 400 };
    Err(ProviderError::Status {
        status,
        retry_after: None,
        message,
    })
}

/// Map an API-Football short status code onto the lifecycle.
pub fn status_from_code(code: &str) -> Option<MatchStatus> {
    let status = match code {
        "TBD" | "NS" => MatchStatus::Scheduled,
        "1H" | "2H" | "ET" | "BT" | "P" | "LIVE" | "INT" | "SUSP" => MatchStatus::Live,
        "HT" => MatchStatus::HalfTime,
        "FT" | "AET" | "PEN" | "AWD" | "WO" => MatchStatus::Finished,
        "PST" => MatchStatus::Postponed,
        "CANC" | "ABD" => MatchStatus::Cancelled,
        _ => return None,
    };
    Some(status)
}

/// Default shootout probe: `score.penalty.{home,away}` once both are set.
pub fn penalty_score_probe() -> ShootoutProbe {
    shootout_probe_at("score.penalty")
}

/// Probe reading a `{home, away}` pair at a dotted path of the fixture.
pub fn shootout_probe_at(path: &str) -> ShootoutProbe {
    let pointer: String = path
        .split('.')
        .filter(|seg| !seg.is_empty())
        .map(|seg| format!("/{}", seg))
        .collect();
    Arc::new(move |fixture: &Value| {
        let Some(pair) = fixture.pointer(&pointer) else {
            return Ok(None);
        };
        let home = count_field(&pair["home"], "shootout.home")?;
        let away = count_field(&pair["away"], "shootout.away")?;
        Ok(home.zip(away).map(|(h, a)| Score::new(h, a)))
    })
}

/// Decoder for API-Football payloads.
pub struct ApiFootballDecoder {
    shootout: ShootoutProbe,
}

impl ApiFootballDecoder {
    pub fn new(shootout: ShootoutProbe) -> Self {
        ApiFootballDecoder { shootout }
    }
}

impl Default for ApiFootballDecoder {
    fn default() -> Self {
        Self::new(penalty_score_probe())
    }
}

impl PayloadDecoder for ApiFootballDecoder {
    fn fixtures(&self, raw: &Value, fetched_at: DateTime<Utc>) -> Result<Vec<MatchSnapshot>, String> {
        response_items(raw)?
            .iter()
            .map(|item| parse_fixture(item, &self.shootout, fetched_at))
            .collect()
    }

    fn live_match(
        &self,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<MatchSnapshot>, String> {
        match response_items(raw)?.first() {
            Some(item) => parse_fixture(item, &self.shootout, fetched_at).map(Some),
            None => Ok(None),
        }
    }

    fn timeline(&self, raw: &Value, snapshot: &MatchSnapshot) -> Result<Vec<TimelineEntry>, String> {
        let mut entries = Vec::new();
        for ev in response_items(raw)? {
            if let Some(entry) = parse_timeline_entry(ev, snapshot)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

fn response_items(raw: &Value) -> Result<&Vec<Value>, String> {
    raw.get("response")
        .and_then(Value::as_array)
        .ok_or_else(|| "'response' is missing or not a list".to_string())
}

/// Ids arrive as numbers, occasionally as strings.
fn id_field(v: &Value) -> Option<String> {
    v.as_u64()
        .map(|n| n.to_string())
        .or_else(|| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

/// Absent or null counts as `None`; anything else must be a non-negative int.
fn count_field(v: &Value, what: &str) -> Result<Option<u32>, String> {
    match v {
        Value::Null => Ok(None),
        other => {
            let n = other
                .as_u64()
                .ok_or_else(|| format!("{} is not a non-negative integer: {}", what, other))?;
            u32::try_from(n)
                .map(Some)
                .map_err(|_| format!("{} is out of range: {}", what, n))
        }
    }
}

fn parse_team(v: &Value, side: &str) -> Result<Team, String> {
    let id = id_field(&v["id"]).ok_or_else(|| format!("teams.{}.id missing", side))?;
    let name = v["name"]
        .as_str()
        .ok_or_else(|| format!("teams.{}.name missing", side))?;
    Ok(Team {
        id,
        name: name.to_string(),
        short_name: v["code"].as_str().map(str::to_string),
        league: None,
        country: v["country"].as_str().map(str::to_string),
    })
}

fn parse_fixture(
    item: &Value,
    shootout: &ShootoutProbe,
    fetched_at: DateTime<Utc>,
) -> Result<MatchSnapshot, String> {
    let fixture = &item["fixture"];
    let match_id = id_field(&fixture["id"]).ok_or("fixture.id missing")?;

    let date = fixture["date"].as_str().ok_or("fixture.date missing")?;
    let kickoff = DateTime::parse_from_rfc3339(date)
        .map_err(|e| format!("fixture.date '{}' is not RFC 3339: {}", date, e))?
        .with_timezone(&Utc);

    let code = fixture["status"]["short"]
        .as_str()
        .ok_or("fixture.status.short missing")?;
    let status =
        status_from_code(code).ok_or_else(|| format!("unknown fixture status '{}'", code))?;
    let minute = count_field(&fixture["status"]["elapsed"], "fixture.status.elapsed")?;

    let home = parse_team(&item["teams"]["home"], "home")?;
    let away = parse_team(&item["teams"]["away"], "away")?;

    let score = Score::new(
        count_field(&item["goals"]["home"], "goals.home")?.unwrap_or(0),
        count_field(&item["goals"]["away"], "goals.away")?.unwrap_or(0),
    );

    Ok(MatchSnapshot {
        match_id,
        home,
        away,
        competition: item["league"]["name"].as_str().map(str::to_string),
        status,
        score,
        minute,
        recorded_events: Default::default(),
        kickoff,
        last_updated: fetched_at,
        timeline: Vec::new(),
        shootout: shootout(item)?,
    })
}

/// Entries without a type are skipped.
fn parse_timeline_entry(ev: &Value, snapshot: &MatchSnapshot) -> Result<Option<TimelineEntry>, String> {
    let Some(kind_str) = ev["type"].as_str() else {
        return Ok(None);
    };
    let detail = ev["detail"].as_str().unwrap_or_default();
    let in_shootout = ev["comments"].as_str() == Some("Penalty Shootout");

    let kind = match (kind_str.to_lowercase().as_str(), detail) {
        ("goal", "Missed Penalty") if in_shootout => TimelineKind::ShootoutMissed,
        ("goal", _) if in_shootout => TimelineKind::ShootoutScored,
        ("goal", "Own Goal") => TimelineKind::OwnGoal,
        ("goal", "Penalty") => TimelineKind::PenaltyGoal,
        ("goal", "Missed Penalty") => TimelineKind::MissedPenalty,
        ("goal", _) => TimelineKind::Goal,
        ("card", "Red Card") | ("card", "Second Yellow card") => TimelineKind::RedCard,
        ("card", _) => TimelineKind::YellowCard,
        ("subst", _) => TimelineKind::Substitution,
        _ => TimelineKind::Other,
    };

    let team_id = id_field(&ev["team"]["id"]);
    let side = match team_id {
        Some(id) if id == snapshot.home.id => Some(Side::Home),
        Some(id) if id == snapshot.away.id => Some(Side::Away),
        _ => None,
    };

    Ok(Some(TimelineEntry {
        kind,
        side,
        minute: count_field(&ev["time"]["elapsed"], "time.elapsed")?,
        player: ev["player"]["name"].as_str().map(str::to_string),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    /// Minimal API-Football fixture object.
    pub(crate) fn fixture_json(
        id: u64,
        status: &str,
        elapsed: Option<u32>,
        home_goals: Option<u32>,
        away_goals: Option<u32>,
        kickoff: &str,
    ) -> Value {
        json!({
            "fixture": {
                "id": id,
                "date": kickoff,
                "status": { "short": status, "elapsed": elapsed }
            },
            "league": { "name": "Premier League" },
            "teams": {
                "home": { "id": 42, "name": "Arsenal" },
                "away": { "id": 49, "name": "Chelsea" }
            },
            "goals": { "home": home_goals, "away": away_goals },
            "score": { "penalty": { "home": null, "away": null } }
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 4, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_status_from_code() {
        assert_eq!(status_from_code("NS"), Some(MatchStatus::Scheduled));
        assert_eq!(status_from_code("2H"), Some(MatchStatus::Live));
        assert_eq!(status_from_code("HT"), Some(MatchStatus::HalfTime));
        assert_eq!(status_from_code("PEN"), Some(MatchStatus::Finished));
        assert_eq!(status_from_code("PST"), Some(MatchStatus::Postponed));
        assert_eq!(status_from_code("ABD"), Some(MatchStatus::Cancelled));
        assert_eq!(status_from_code("??"), None);
    }

    #[test]
    fn test_parse_live_fixture() {
        let raw = json!({
            "errors": [],
            "response": [fixture_json(101, "1H", Some(23), Some(1), Some(0), "2024-05-04T14:00:00+00:00")]
        });
        let snap = ApiFootballDecoder::default()
            .live_match(&raw, now())
            .unwrap()
            .unwrap();
        assert_eq!(snap.match_id, "101");
        assert_eq!(snap.status, MatchStatus::Live);
        assert_eq!(snap.score, Score::new(1, 0));
        assert_eq!(snap.minute, Some(23));
        assert_eq!(snap.home.name, "Arsenal");
        assert_eq!(snap.competition.as_deref(), Some("Premier League"));
        assert_eq!(snap.kickoff, Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap());
        assert_eq!(snap.shootout, None);
    }

    #[test]
    fn test_scheduled_fixture_has_no_score_yet() {
        let raw = json!({
            "response": [fixture_json(7, "NS", None, None, None, "2024-05-06T19:45:00+00:00")]
        });
        let snaps = ApiFootballDecoder::default().fixtures(&raw, now()).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].score, Score::new(0, 0));
        assert_eq!(snaps[0].minute, None);
    }

    #[test]
    fn test_empty_response_is_not_a_violation() {
        let raw = json!({ "response": [] });
        assert_eq!(ApiFootballDecoder::default().live_match(&raw, now()), Ok(None));
    }

    #[test]
    fn test_schema_violations() {
        let decoder = ApiFootballDecoder::default();
        assert!(decoder.fixtures(&json!({ "response": {} }), now()).is_err());

        let mut bad_status = fixture_json(1, "XYZ", None, None, None, "2024-05-06T19:45:00+00:00");
        assert!(decoder
            .fixtures(&json!({ "response": [bad_status.clone()] }), now())
            .is_err());

        bad_status["fixture"]["status"]["short"] = json!("NS");
        bad_status["goals"]["home"] = json!(-1);
        assert!(decoder.fixtures(&json!({ "response": [bad_status] }), now()).is_err());
    }

    #[test]
    fn test_penalty_probe() {
        let mut item = fixture_json(1, "P", Some(120), Some(1), Some(1), "2024-05-04T14:00:00+00:00");
        assert_eq!(penalty_score_probe()(&item), Ok(None));
        item["score"]["penalty"] = json!({ "home": 3, "away": 2 });
        assert_eq!(penalty_score_probe()(&item), Ok(Some(Score::new(3, 2))));

        item["extra"] = json!({ "shootout": { "home": 5, "away": 4 } });
        assert_eq!(shootout_probe_at("extra.shootout")(&item), Ok(Some(Score::new(5, 4))));
        assert_eq!(shootout_probe_at("missing.path")(&item), Ok(None));

        item["score"]["penalty"] = json!({ "home": 4_294_967_296u64, "away": 2 });
        assert!(penalty_score_probe()(&item).is_err());
    }

    #[test]
    fn test_out_of_range_counts_are_violations() {
        let decoder = ApiFootballDecoder::default();
        let mut item = fixture_json(7, "1H", Some(30), Some(1), Some(0), "2024-05-04T14:00:00+00:00");
        item["goals"]["home"] = json!(4_294_967_297u64);
        assert!(decoder.fixtures(&json!({ "response": [item] }), now()).is_err());

        let raw = json!({ "response": [fixture_json(7, "1H", Some(30), Some(1), Some(0), "2024-05-04T14:00:00+00:00")] });
        let snap = decoder.live_match(&raw, now()).unwrap().unwrap();
        let events = json!({ "response": [
            { "time": { "elapsed": 4_294_967_296u64 }, "team": { "id": 42 }, "type": "Goal", "detail": "Normal Goal" }
        ]});
        assert!(decoder.timeline(&events, &snap).is_err());
    }

    #[test]
    fn test_parse_timeline() {
        let decoder = ApiFootballDecoder::default();
        let raw = json!({ "response": [fixture_json(101, "2H", Some(60), Some(1), Some(1), "2024-05-04T14:00:00+00:00")] });
        let snap = decoder.live_match(&raw, now()).unwrap().unwrap();

        let events = json!({ "response": [
            { "time": { "elapsed": 23 }, "team": { "id": 42 }, "player": { "name": "B. Saka" },
              "type": "Goal", "detail": "Normal Goal", "comments": null },
            { "time": { "elapsed": 40 }, "team": { "id": 49 }, "player": { "name": "C. Palmer" },
              "type": "Card", "detail": "Yellow Card" },
            { "time": { "elapsed": 55 }, "team": { "id": 49 }, "player": { "name": "C. Palmer" },
              "type": "Goal", "detail": "Penalty" },
            { "time": { "elapsed": 120 }, "team": { "id": 42 }, "player": { "name": "M. Odegaard" },
              "type": "Goal", "detail": "Penalty", "comments": "Penalty Shootout" },
            { "detail": "no type" }
        ]});
        let timeline = decoder.timeline(&events, &snap).unwrap();
        assert_eq!(timeline.len(), 4);
        assert_eq!(timeline[0].kind, TimelineKind::Goal);
        assert_eq!(timeline[0].side, Some(Side::Home));
        assert_eq!(timeline[0].player.as_deref(), Some("B. Saka"));
        assert_eq!(timeline[1].kind, TimelineKind::YellowCard);
        assert_eq!(timeline[2].kind, TimelineKind::PenaltyGoal);
        assert_eq!(timeline[2].side, Some(Side::Away));
        assert_eq!(timeline[3].kind, TimelineKind::ShootoutScored);
    }

    #[test]
    fn test_body_errors() {
        assert!(check_body_errors(&json!({ "errors": [] })).is_ok());
        assert!(check_body_errors(&json!({ "errors": {} })).is_ok());
        match check_body_errors(&json!({ "errors": { "rateLimit": "Too many requests" } })) {
            Err(ProviderError::Status { status, .. }) => assert_eq!(status, 429),
            other => panic!("unexpected {:?}", other),
        }
        match check_body_errors(&json!({ "errors": { "token": "Error/Missing application key" } })) {
            Err(ProviderError::Status { status, .. }) => assert_eq!(status, 400),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_urls() {
        let api = ApiFootball::new(
            "key",
            "https://api-football-v1.p.rapidapi.com/v3",
            Duration::from_secs(5),
        )
        .unwrap();
        let url = api.url_for(&FetchRequest::MatchEvents {
            match_id: "101".into(),
        });
        assert_eq!(
            url.as_str(),
            "https://api-football-v1.p.rapidapi.com/v3/fixtures/events?fixture=101"
        );

        let url = api.url_for(&FetchRequest::Fixtures {
            team_id: "42".into(),
            from: chrono::NaiveDate::from_ymd_opt(2024, 5, 4).unwrap(),
            to: chrono::NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(),
        });
        assert_eq!(
            url.as_str(),
            "https://api-football-v1.p.rapidapi.com/v3/fixtures?team=42&from=2024-05-04&to=2024-05-07&timezone=UTC"
        );
        assert_eq!(api.host, "api-football-v1.p.rapidapi.com");
    }
}
