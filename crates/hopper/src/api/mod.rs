//! Downstream ingest API collaborator
//!
//! `send` delivers one record and reports the classified outcome plus
//! the server-assigned identifier. `read` and `trigger_reindex` support
//! the optional synthetic-workload and reindex loops.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

/// Classified result of a delivery attempt. `ServerError` and
/// `Unavailable` are transient (the caller may retry); `ClientError`
/// means the record itself was rejected and will never succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    ClientError,
    ServerError,
    Unavailable,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Outcome::ServerError | Outcome::Unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub outcome: Outcome,
    pub assigned_id: Option<String>,
}

/// Whether the downstream reindex operation has work left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexProgress {
    MoreWork,
    Done,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env::var("API_BASE_URL").context("API_BASE_URL must be set")?,
            username: env::var("API_USERNAME").ok(),
            password: env::var("API_PASSWORD").ok(),
            timeout_secs: env::var("API_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(120),
        })
    }

    /// Config pointing at an explicit base URL, credentials optional.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
            timeout_secs: 120,
        }
    }
}

pub struct IngestClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl IngestClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, config })
    }

    /// Expected transaction timeout of the downstream server; the
    /// process-wide drain timeout should exceed this so in-flight
    /// responses are not lost before their outcome is recorded.
    pub fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }

    /// Deliver one record. Bundles post to the service root, single
    /// resources to their type collection. Network failures map to
    /// `Unavailable` rather than surfacing as errors; the caller deals
    /// in outcomes only.
    pub async fn send(&self, resource_type: &str, payload: &Value) -> SendResult {
        let url = if payload.get("entry").is_some() {
            self.config.base_url.clone()
        } else {
            format!("{}/{}", self.config.base_url, resource_type)
        };

        let mut request = self.http.post(&url).json(payload);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "Request failed to reach the server");
                return SendResult {
                    outcome: Outcome::Unavailable,
                    assigned_id: None,
                };
            },
        };

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let outcome = classify_status(status.as_u16());
        let assigned_id = if outcome.is_success() {
            location
                .as_deref()
                .and_then(|loc| parse_assigned_id(loc, resource_type))
                .or_else(|| {
                    payload
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
        } else {
            None
        };

        SendResult {
            outcome,
            assigned_id,
        }
    }

    /// Read one resource back; used by the synthetic read workload.
    pub async fn read(&self, resource_type: &str, id: &str) -> Outcome {
        let url = format!("{}/{}/{}", self.config.base_url, resource_type, id);

        let mut request = self.http.get(&url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        match request.send().await {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(_) => Outcome::Unavailable,
        }
    }

    /// Ask the server to reindex a batch of resources. 204 means the
    /// server found nothing left to reindex.
    pub async fn trigger_reindex(&self, tstamp: &str, count: u32) -> Result<ReindexProgress> {
        let url = format!("{}/$reindex", self.config.base_url);
        let body = json!({ "tstamp": tstamp, "resourceCount": count });

        let mut request = self.http.post(&url).json(&body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request.send().await.context("Reindex request failed")?;
        let status = response.status();

        match status.as_u16() {
            204 => Ok(ReindexProgress::Done),
            s if (200..300).contains(&s) => Ok(ReindexProgress::MoreWork),
            s => bail!("Reindex call returned status {}", s),
        }
    }
}

fn classify_status(status: u16) -> Outcome {
    match status {
        201 => Outcome::Created,
        s if (200..300).contains(&s) => Outcome::Updated,
        503 => Outcome::Unavailable,
        s if (400..500).contains(&s) => Outcome::ClientError,
        _ => Outcome::ServerError,
    }
}

/// Pull the assigned identifier out of a Location header such as
/// `https://host/base/Patient/17/_history/1`.
fn parse_assigned_id(location: &str, resource_type: &str) -> Option<String> {
    let segments: Vec<&str> = location
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if let Some(pos) = segments.iter().rposition(|s| *s == resource_type) {
        if let Some(id) = segments.get(pos + 1) {
            return Some((*id).to_string());
        }
    }

    segments.last().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(201), Outcome::Created);
        assert_eq!(classify_status(200), Outcome::Updated);
        assert_eq!(classify_status(400), Outcome::ClientError);
        assert_eq!(classify_status(422), Outcome::ClientError);
        assert_eq!(classify_status(500), Outcome::ServerError);
        assert_eq!(classify_status(503), Outcome::Unavailable);
    }

    #[test]
    fn test_parse_assigned_id_with_history() {
        let id = parse_assigned_id("https://host/base/Patient/17/_history/1", "Patient");
        assert_eq!(id.as_deref(), Some("17"));
    }

    #[test]
    fn test_parse_assigned_id_plain() {
        let id = parse_assigned_id("/base/Observation/abc-123", "Observation");
        assert_eq!(id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_outcome_classes() {
        assert!(Outcome::Created.is_success());
        assert!(Outcome::Unavailable.is_transient());
        assert!(!Outcome::ClientError.is_transient());
        assert!(!Outcome::ClientError.is_success());
    }
}
