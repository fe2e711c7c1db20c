use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::ServiceConfig;
use crate::error::SyncError;

/// Errors talking to the memory service.
///
/// Network failures and service-side rejections degrade the same way; they
/// differ only in the message shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ServiceError::Status { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

impl From<ServiceError> for SyncError {
    fn from(e: ServiceError) -> Self {
        SyncError::ServiceUnavailable(e.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Health probe response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
}

/// An agent action to record in episodic memory
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub project_name: String,
    pub agent_name: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// One recorded agent action returned by the history endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub agent_name: Option<String>,
    pub action: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// The operations the watcher and validator need from the memory service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Probe the service; any 2xx is healthy
    async fn health(&self) -> ServiceResult<HealthStatus>;

    /// Record an agent action; returns the memory id when the service reports one
    async fn record_action(&self, action: &ActionRecord) -> ServiceResult<Option<String>>;

    /// Agent actions for `project` recorded at or after `since`
    async fn recent_activity(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<ActivityEntry>>;

    /// Free-text context query scoped to `project`
    async fn query_context(
        &self,
        project: &str,
        query: &str,
        k: usize,
    ) -> ServiceResult<Vec<serde_json::Value>>;
}

/// HTTP client for the memory service's `/ai-agents` API
pub struct HttpMemoryClient {
    client: Client,
    base_url: Url,
    user_id: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ActionPayload<'a> {
    #[serde(flatten)]
    action: &'a ActionRecord,
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct QueryPayload<'a> {
    project_name: &'a str,
    query: &'a str,
    memory_type: &'a str,
    k: usize,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    memory_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

const HISTORY_LIMIT: usize = 50;

impl HttpMemoryClient {
    pub fn new(base_url: Url, config: &ServiceConfig) -> Result<Self, SyncError> {
        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            user_id: config.user_id.clone(),
            api_key: config.api_key(),
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> ServiceResult<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path)).map_err(|e| ServiceError::Decode(e.to_string()))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> ServiceResult<String> {
        let response = self.authorize(req).send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(self.timeout)
            } else {
                ServiceError::from(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }
        Ok(body)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[async_trait]
impl MemoryService for HttpMemoryClient {
    async fn health(&self) -> ServiceResult<HealthStatus> {
        let url = self.endpoint("/health")?;
        let body = self.send(self.client.get(url)).await?;
        // Some deployments answer with plain text; reachability is what matters.
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }

    async fn record_action(&self, action: &ActionRecord) -> ServiceResult<Option<String>> {
        let url = self.endpoint("/ai-agents/action")?;
        let payload = ActionPayload {
            action,
            user_id: &self.user_id,
        };
        let body = self.send(self.client.post(url).json(&payload)).await?;
        let parsed: ActionResponse =
            serde_json::from_str(&body).map_err(|e| ServiceError::Decode(e.to_string()))?;
        info!(
            project = %action.project_name,
            agent = %action.agent_name,
            memory_id = ?parsed.memory_id,
            "action recorded"
        );
        Ok(parsed.memory_id)
    }

    async fn recent_activity(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<ActivityEntry>> {
        let mut url = self.endpoint("/ai-agents/history/")?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Decode("base URL cannot hold a path".into()))?
            .pop_if_empty()
            .push(project);
        let limit = HISTORY_LIMIT.to_string();
        let req = self
            .client
            .get(url)
            .query(&[("limit", limit.as_str()), ("user_id", self.user_id.as_str())]);
        let body = self.send(req).await?;
        let parsed: HistoryResponse =
            serde_json::from_str(&body).map_err(|e| ServiceError::Decode(e.to_string()))?;
        let entries = filter_recent(&parsed.history, since);
        debug!(project, total = parsed.history.len(), recent = entries.len(), "history fetched");
        Ok(entries)
    }

    async fn query_context(
        &self,
        project: &str,
        query: &str,
        k: usize,
    ) -> ServiceResult<Vec<serde_json::Value>> {
        let url = self.endpoint("/ai-agents/query")?;
        let payload = QueryPayload {
            project_name: project,
            query,
            memory_type: "all",
            k,
            user_id: &self.user_id,
        };
        let body = self.send(self.client.post(url).json(&payload)).await?;
        let parsed: QueryResponse =
            serde_json::from_str(&body).map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(parsed.results)
    }
}

/// Keep history entries whose timestamp falls at or after `since`.
/// Entries without a recognisable timestamp are dropped.
pub fn filter_recent(history: &[serde_json::Value], since: DateTime<Utc>) -> Vec<ActivityEntry> {
    history
        .iter()
        .filter_map(|item| {
            let recorded_at = ["created_at", "timestamp", "ts"]
                .iter()
                .find_map(|key| item.get(*key).and_then(parse_timestamp))?;
            if recorded_at < since {
                return None;
            }
            Some(ActivityEntry {
                agent_name: item
                    .get("agent_name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                action: item
                    .get("action")
                    .or_else(|| item.get("content"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                recorded_at,
            })
        })
        .collect()
}

/// Epoch millis, epoch seconds, or RFC 3339.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(n) = value.as_i64() {
        // Anything past 1e11 cannot be seconds (year 5138).
        return if n.abs() >= 100_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }
    if let Some(f) = value.as_f64() {
        return Utc.timestamp_millis_opt((f * 1000.0) as i64).single();
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn test_client_new() {
        let client = HttpMemoryClient::new(
            Url::parse("http://localhost:8080/").unwrap(),
            &ServiceConfig::default(),
        )
        .unwrap();
        assert_eq!(client.user_id, "ai-agent-system");
        assert_eq!(
            client.endpoint("/health").unwrap().as_str(),
            "http://localhost:8080/health"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = HttpMemoryClient::new(
            Url::parse("https://mem.example.com/api").unwrap(),
            &ServiceConfig::default(),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("/ai-agents/action").unwrap().as_str(),
            "https://mem.example.com/api/ai-agents/action"
        );
    }

    #[test]
    fn test_action_payload_serialization() {
        let action = ActionRecord {
            project_name: "billing".into(),
            agent_name: "architect".into(),
            action: "Created schema".into(),
            context: None,
            outcome: Some("ok".into()),
        };
        let payload = ActionPayload {
            action: &action,
            user_id: "ai-agent-system",
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["project_name"], "billing");
        assert_eq!(value["user_id"], "ai-agent-system");
        assert_eq!(value["outcome"], "ok");
        assert!(value.get("context").is_none());
    }

    #[test]
    fn test_filter_recent_accepts_all_timestamp_shapes() {
        let now = Utc::now();
        let since = now - ChronoDuration::hours(24);
        let history = vec![
            json!({"agent_name": "a", "action": "millis", "created_at": now.timestamp_millis()}),
            json!({"action": "secs", "timestamp": now.timestamp()}),
            json!({"content": "rfc", "ts": now.to_rfc3339()}),
            json!({"action": "old", "created_at": (now - ChronoDuration::days(3)).timestamp_millis()}),
            json!({"action": "undated"}),
        ];
        let recent = filter_recent(&history, since);
        let actions: Vec<_> = recent.iter().filter_map(|e| e.action.as_deref()).collect();
        assert_eq!(actions, vec!["millis", "secs", "rfc"]);
        assert_eq!(recent[0].agent_name.as_deref(), Some("a"));
    }

    #[test]
    fn test_service_error_messages_distinguish_causes() {
        let net = ServiceError::Network("connection refused".into());
        let auth = ServiceError::Status {
            status: 401,
            body: "bad token".into(),
        };
        assert!(net.to_string().starts_with("network error"));
        assert!(auth.to_string().contains("401"));
        assert!(auth.is_auth());
        assert!(!net.is_auth());

        let converted: SyncError = auth.into();
        assert!(matches!(converted, SyncError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        // Port 9 (discard) on localhost is essentially never listening.
        let config = ServiceConfig {
            request_timeout_ms: 500,
            ..ServiceConfig::default()
        };
        let client =
            HttpMemoryClient::new(Url::parse("http://127.0.0.1:9").unwrap(), &config).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Network(_) | ServiceError::Timeout(_)
        ));
    }
}
