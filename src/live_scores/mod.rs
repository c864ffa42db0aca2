pub mod api_football;
pub mod circuit;
pub mod fetcher;
pub mod provider;
pub mod quota;

pub use api_football::{ApiFootball, ApiFootballDecoder};
pub use circuit::BreakerPolicy;
pub use fetcher::{ResilientFetcher, RetryPolicy};
pub use provider::{FetchRequest, MatchDataProvider, PayloadDecoder};

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::error;

use crate::db::models::{MatchSnapshot, TimelineEntry};
use crate::error::FetchError;

/// Typed view over the resilient fetcher: every call returns normalized
/// snapshots or a final `FetchError`. Decode failures surface as
/// `SchemaViolation`.
#[derive(Clone)]
pub struct MatchFeed {
    fetcher: Arc<ResilientFetcher>,
    decoder: Arc<dyn PayloadDecoder>,
}

impl MatchFeed {
    pub fn new(fetcher: Arc<ResilientFetcher>, decoder: Arc<dyn PayloadDecoder>) -> Self {
        MatchFeed { fetcher, decoder }
    }

    /// Fixtures of one team between two UTC dates (inclusive).
    pub async fn fixtures(
        &self,
        team_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MatchSnapshot>, FetchError> {
        let request = FetchRequest::Fixtures {
            team_id: team_id.to_string(),
            from,
            to,
        };
        let raw = self.fetcher.fetch(&request).await?;
        self.decoder
            .fixtures(&raw, Utc::now())
            .map_err(|e| schema_violation(&request, e))
    }

    pub async fn live_match(&self, match_id: &str) -> Result<MatchSnapshot, FetchError> {
        let request = FetchRequest::LiveMatch {
            match_id: match_id.to_string(),
        };
        let raw = self.fetcher.fetch(&request).await?;
        match self.decoder.live_match(&raw, Utc::now()) {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(FetchError::ClientError {
                status: 404,
                message: format!("no fixture returned for {}", match_id),
            }),
            Err(e) => Err(schema_violation(&request, e)),
        }
    }

    /// Goal/card timeline of a match, sides resolved against `snapshot`.
    pub async fn timeline(&self, snapshot: &MatchSnapshot) -> Result<Vec<TimelineEntry>, FetchError> {
        let request = FetchRequest::MatchEvents {
            match_id: snapshot.match_id.clone(),
        };
        let raw = self.fetcher.fetch(&request).await?;
        self.decoder
            .timeline(&raw, snapshot)
            .map_err(|e| schema_violation(&request, e))
    }
}

fn schema_violation(request: &FetchRequest, reason: String) -> FetchError {
    error!(
        endpoint = request.endpoint_class().as_str(),
        "Provider response violates the expected schema: {}", reason
    );
    FetchError::SchemaViolation(reason)
}
