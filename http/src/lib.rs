//! Fetch numerically indexed JSON records over HTTP.
//!
//! [Client] requests `{base_url}/{index}` and implements [Fetcher] for [serde_json::Value]. Every
//! request carries a bearer token, a `User-Agent` drawn at random from a rotation and a fixed set
//! of query parameters. A request that fails in any way (see [Failure]) yields `None` and is never
//! retried.

use blockfetch_ingest::{Fetcher, Payload};
use rand::seq::SliceRandom;
use reqwest::{header, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

/// Movie endpoint of The Movie Database API.
pub const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3/movie";

/// Default bound on the duration of a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// User agents rotated across requests by default.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.3",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Safari/605.1.1",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/103.0.0.0 Safari/537.3",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_13_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.2 Safari/605.1.1",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.1",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.1",
];

/// Sections appended to every movie response by default.
const APPEND_TO_RESPONSE: &str = "alternative_titles,changes,credits,external_ids,images,keywords,latest,lists,recommendations,release_dates,reviews,similar,translations,videos,providers";

/// Errors that can occur when creating a [Client].
#[derive(Error, Debug)]
pub enum Error {
    #[error("no user agents configured")]
    NoUserAgents,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("failed to build client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Reasons a request yields no record.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("status {0}")]
    Status(StatusCode),
    #[error("undecodable body: {0}")]
    Body(reqwest::Error),
    #[error("remote reported failure")]
    Unsuccessful,
    #[error("returned id {0} does not match")]
    Mismatch(Value),
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Body(err)
        } else {
            Self::Transport(err)
        }
    }
}

/// Configuration for the [Client].
#[derive(Clone, Debug)]
pub struct Config {
    /// URL that indices are appended to (without a trailing slash).
    pub base_url: String,

    /// Token sent as `Authorization: Bearer <api_key>`.
    pub api_key: String,

    /// User agents to pick from (at random) for each request.
    pub user_agents: Vec<String>,

    /// Query parameters sent with every request.
    pub query: Vec<(String, String)>,

    /// Maximum duration of a request, including reading the body.
    pub timeout: Duration,
}

impl Config {
    /// Configuration for The Movie Database API, authenticated with `api_key`.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            user_agents: USER_AGENTS.iter().map(|agent| agent.to_string()).collect(),
            query: vec![
                ("append_to_response".into(), APPEND_TO_RESPONSE.into()),
                ("language".into(), "en-US".into()),
            ],
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A [Fetcher] of JSON records served one per URL.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    cfg: Arc<Config>,
}

impl Client {
    /// Create a new client.
    pub fn new(mut cfg: Config) -> Result<Self, Error> {
        if cfg.user_agents.is_empty() {
            return Err(Error::NoUserAgents);
        }
        if header::HeaderValue::from_str(&format!("Bearer {}", cfg.api_key)).is_err() {
            return Err(Error::InvalidApiKey);
        }
        while cfg.base_url.ends_with('/') {
            cfg.base_url.pop();
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            cfg: Arc::new(cfg),
        })
    }

    fn user_agent(&self) -> &str {
        self.cfg
            .user_agents
            .choose(&mut rand::thread_rng())
            .map_or(USER_AGENTS[0], String::as_str)
    }

    /// Request the record at `index`, reporting why none was returned.
    pub async fn request(&self, index: u64) -> Result<Value, Failure> {
        let url = format!("{}/{}", self.cfg.base_url, index);
        let user_agent = self.user_agent().to_string();
        let response = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, user_agent)
            .bearer_auth(&self.cfg.api_key)
            .query(&self.cfg.query)
            .timeout(self.cfg.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Failure::Status(status));
        }
        let body: Value = response.json().await?;
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(Failure::Unsuccessful);
        }

        // Persisted records are resumed and merged by this identity
        if body.index() != Some(index) {
            return Err(Failure::Mismatch(
                body.get("id").cloned().unwrap_or(Value::Null),
            ));
        }
        Ok(body)
    }
}

impl Fetcher<Value> for Client {
    async fn fetch(&self, index: u64) -> Option<Value> {
        match self.request(index).await {
            Ok(record) => Some(record),
            Err(failure) => {
                debug!(index, %failure, "no record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use std::{collections::HashMap, net::SocketAddr};
    use tokio::net::TcpListener;

    const API_KEY: &str = "secret";

    async fn movie(
        Path(index): Path<u64>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        let authorized = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some("Bearer secret");
        let agent = headers
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !authorized
            || !USER_AGENTS.contains(&agent)
            || query.get("language").map(String::as_str) != Some("en-US")
            || !query.contains_key("append_to_response")
        {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        match index {
            404 => (
                AxumStatus::NOT_FOUND,
                Json(json!({"success": false, "status_code": 34})),
            )
                .into_response(),
            500 => AxumStatus::INTERNAL_SERVER_ERROR.into_response(),
            7 => Json(json!({"success": false})).into_response(),
            8 => Json(json!({"id": 9, "title": "wrong"})).into_response(),
            9 => "not json".into_response(),
            10 => Json(json!({"id": "10", "title": "textual"})).into_response(),
            11 => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"id": 11})).into_response()
            }
            _ => Json(json!({"id": index, "title": format!("movie {index}")})).into_response(),
        }
    }

    async fn serve() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let app = Router::new().route("/movie/{index}", get(movie));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    async fn client(api_key: &str) -> Client {
        let address = serve().await;
        let mut cfg = Config::new(api_key);
        cfg.base_url = format!("http://{address}/movie/");
        cfg.timeout = Duration::from_millis(500);
        Client::new(cfg).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_record() {
        let client = client(API_KEY).await;
        let record = client.fetch(42).await.unwrap();
        assert_eq!(record["id"], 42);
        assert_eq!(record["title"], "movie 42");

        // Identifiers serialized as strings are accepted and keep their identity
        let textual = client.fetch(10).await.unwrap();
        assert_eq!(textual["title"], "textual");
        assert_eq!(textual.index(), Some(10));
    }

    #[tokio::test]
    async fn test_failures_yield_none() {
        let client = client(API_KEY).await;
        assert!(matches!(
            client.request(404).await,
            Err(Failure::Status(StatusCode::NOT_FOUND))
        ));
        assert!(matches!(
            client.request(500).await,
            Err(Failure::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
        assert!(matches!(client.request(7).await, Err(Failure::Unsuccessful)));
        assert!(matches!(client.request(8).await, Err(Failure::Mismatch(_))));
        assert!(matches!(client.request(9).await, Err(Failure::Body(_))));
        assert!(matches!(client.request(11).await, Err(Failure::Timeout)));
        for index in [404, 500, 7, 8, 9, 11] {
            assert!(client.fetch(index).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_unauthorized_yields_none() {
        let client = client("wrong").await;
        assert!(matches!(
            client.request(42).await,
            Err(Failure::Status(StatusCode::UNAUTHORIZED))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_yields_none() {
        // Bind and drop a listener to find a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = Config::new(API_KEY);
        cfg.base_url = format!("http://{address}");
        let client = Client::new(cfg).unwrap();
        assert!(matches!(client.request(42).await, Err(Failure::Transport(_))));
        assert!(client.fetch(42).await.is_none());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut cfg = Config::new(API_KEY);
        cfg.user_agents.clear();
        assert!(matches!(Client::new(cfg), Err(Error::NoUserAgents)));
        assert!(matches!(
            Client::new(Config::new("line\nbreak")),
            Err(Error::InvalidApiKey)
        ));
    }
}
