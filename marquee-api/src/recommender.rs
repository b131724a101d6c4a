//! Movie recommendations backed by Supabase pgvector.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use marquee_metrics::transport::{MAX_BODY_SNIPPET, truncate_body};
use marquee_metrics::{Counter, SharedRegistry};

use crate::config::SupabaseConfig;

/// Name of the lookup counter, labelled by `outcome`.
pub const LOOKUPS_METRIC: &str = "recommendation_lookups_total";

/// A single recommended movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRecommendation {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    pub similarity: f64,
}

/// Recommendation errors.
#[derive(Debug, Error)]
pub enum RecommendError {
    /// Unknown title, or no match above the similarity threshold.
    #[error("Movie with title '{0}' not found or no recommendations available.")]
    NotFound(String),
    #[error("Recommendation backend error: {0}")]
    Upstream(String),
    #[error("Recommender misconfigured: {0}")]
    Config(String),
}

/// Source of recommendations.
pub trait Recommender: Send + Sync + 'static {
    /// Up to `count` movies similar to the one titled `title`.
    fn recommend_by_title(
        &self,
        title: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<MovieRecommendation>, RecommendError>> + Send;
}

#[derive(Debug, Deserialize)]
struct MovieId {
    id: i64,
}

#[derive(Debug, Serialize)]
struct MatchParams {
    p_movie_id: i64,
    match_count: usize,
    match_threshold: f64,
}

#[derive(Debug)]
struct LookupCounters {
    found: Counter,
    not_found: Counter,
    error: Counter,
}

impl LookupCounters {
    fn register(registry: &SharedRegistry) -> Self {
        let counter = |outcome: &str| {
            registry
                .counter(LOOKUPS_METRIC, &[("outcome", outcome)])
                .unwrap_or_default()
        };

        Self {
            found: counter("found"),
            not_found: counter("not_found"),
            error: counter("error"),
        }
    }
}

/// Recommender calling the Supabase REST API.
///
/// The movie id is resolved from `movies` by exact title, then the
/// `match_movies` RPC returns the nearest neighbours by embedding.
#[derive(Debug)]
pub struct SupabaseRecommender {
    client: reqwest::Client,
    base_url: String,
    match_threshold: f64,
    lookups: LookupCounters,
}

impl SupabaseRecommender {
    /// Create a recommender from Supabase settings.
    pub fn new(config: &SupabaseConfig, registry: &SharedRegistry) -> Result<Self, RecommendError> {
        let (url, key) = config
            .connection()
            .ok_or_else(|| RecommendError::Config("Supabase URL and key must be set".to_string()))?;

        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(key)
            .map_err(|e| RecommendError::Config(format!("Invalid Supabase key: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| RecommendError::Config(format!("Invalid Supabase key: {}", e)))?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| RecommendError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(url = %url, "Supabase client initialized");

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            match_threshold: config.match_threshold,
            lookups: LookupCounters::register(registry),
        })
    }

    async fn find_movie_id(&self, title: &str) -> Result<Option<i64>, RecommendError> {
        let response = self
            .client
            .get(format!("{}/rest/v1/movies", self.base_url))
            .query(&[
                ("select", "id".to_string()),
                ("title", format!("eq.{}", title)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .map_err(upstream)?;

        let rows: Vec<MovieId> = read_json(response).await?;
        Ok(rows.first().map(|row| row.id))
    }

    async fn match_movies(
        &self,
        movie_id: i64,
        count: usize,
    ) -> Result<Vec<MovieRecommendation>, RecommendError> {
        let params = MatchParams {
            p_movie_id: movie_id,
            match_count: count,
            match_threshold: self.match_threshold,
        };

        let response = self
            .client
            .post(format!("{}/rest/v1/rpc/match_movies", self.base_url))
            .json(&params)
            .send()
            .await
            .map_err(upstream)?;

        read_json(response).await
    }

    async fn lookup(
        &self,
        title: &str,
        count: usize,
    ) -> Result<Vec<MovieRecommendation>, RecommendError> {
        debug!(title, "Finding movie id");
        let Some(movie_id) = self.find_movie_id(title).await? else {
            return Err(RecommendError::NotFound(title.to_string()));
        };

        debug!(title, movie_id, count, "Fetching recommendations");
        let recommendations = self.match_movies(movie_id, count).await?;
        if recommendations.is_empty() {
            warn!(title, movie_id, "No similar movies above the threshold");
            return Err(RecommendError::NotFound(title.to_string()));
        }

        Ok(recommendations)
    }
}

impl Recommender for SupabaseRecommender {
    async fn recommend_by_title(
        &self,
        title: &str,
        count: usize,
    ) -> Result<Vec<MovieRecommendation>, RecommendError> {
        let result = self.lookup(title, count).await;

        match &result {
            Ok(recs) => {
                self.lookups.found.inc();
                info!(title, count = recs.len(), "Found recommendations");
            }
            Err(RecommendError::NotFound(_)) => self.lookups.not_found.inc(),
            Err(e) => {
                self.lookups.error.inc();
                warn!(title, error = %e, "Recommendation lookup failed");
            }
        }

        result
    }
}

fn upstream(e: reqwest::Error) -> RecommendError {
    RecommendError::Upstream(e.to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RecommendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RecommendError::Upstream(format!(
            "Supabase responded with {}: {}",
            status.as_u16(),
            truncate_body(&body, MAX_BODY_SNIPPET)
        )));
    }

    response.json().await.map_err(upstream)
}
