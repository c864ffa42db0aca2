use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use crate::db::models::{MatchSnapshot, TimelineEntry};
use crate::error::ProviderError;

/// One logical request against the upstream match-data provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    /// Fixtures of one team within an inclusive UTC date window.
    Fixtures {
        team_id: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    LiveMatch { match_id: String },
    /// Goal/card timeline and statistics of one match.
    MatchEvents { match_id: String },
}

/// Requests sharing a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Fixtures,
    LiveMatch,
    MatchEvents,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Fixtures => "fixtures",
            EndpointClass::LiveMatch => "live_match",
            EndpointClass::MatchEvents => "match_events",
        }
    }
}

impl FetchRequest {
    pub fn endpoint_class(&self) -> EndpointClass {
        match self {
            FetchRequest::Fixtures { .. } => EndpointClass::Fixtures,
            FetchRequest::LiveMatch { .. } => EndpointClass::LiveMatch,
            FetchRequest::MatchEvents { .. } => EndpointClass::MatchEvents,
        }
    }
}

/// Raw transport to a match-data provider. One call is one network attempt;
/// retries and failure accounting live in the resilient fetcher.
#[async_trait]
pub trait MatchDataProvider: Send + Sync {
    async fn execute(&self, request: &FetchRequest) -> Result<Value, ProviderError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Turns provider payloads into snapshots. An `Err` means the payload broke
/// the provider's contract.
pub trait PayloadDecoder: Send + Sync {
    fn fixtures(&self, raw: &Value, fetched_at: DateTime<Utc>) -> Result<Vec<MatchSnapshot>, String>;

    /// `Ok(None)` when the provider returned no fixture for the id.
    fn live_match(
        &self,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<MatchSnapshot>, String>;

    fn timeline(&self, raw: &Value, snapshot: &MatchSnapshot) -> Result<Vec<TimelineEntry>, String>;
}
