//! Alertmanager silences.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Alertmanager request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Alertmanager returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid silence duration: {0:?}")]
    InvalidDuration(Duration),
}

/// Opaque identifier of a created silence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SilenceId(String);

impl SilenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SilenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub name: String,
    pub value: String,
    pub is_regex: bool,
    #[serde(default = "default_true")]
    pub is_equal: bool,
}

fn default_true() -> bool {
    true
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: false,
            is_equal: true,
        }
    }

    pub fn regex(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: true,
            is_equal: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilenceRequest {
    pub matchers: Vec<Matcher>,
    pub duration: Duration,
    pub comment: String,
}

#[async_trait]
pub trait SilenceManager: Send + Sync {
    async fn create_silence(&self, request: &SilenceRequest) -> Result<SilenceId, AlertError>;

    /// Expires a silence. A silence that is unknown or already expired is
    /// not an error.
    async fn remove_silence(&self, id: &SilenceId) -> Result<(), AlertError>;
}

/// Comment attached to silences, e.g. `Rebooting node - T12345`.
pub fn silence_reason(comment: &str, task_id: Option<&str>) -> String {
    let comment = if comment.is_empty() { "No comment" } else { comment };
    match task_id {
        Some(task) if !task.is_empty() => format!("{} - {}", comment, task),
        _ => comment.to_string(),
    }
}

/// Matches every alert whose `instance` label is `host` (with optional port).
pub fn host_matcher(host: &str) -> Matcher {
    Matcher::regex("instance", format!("^({})(:[0-9]+)?$", host.replace('.', "\\.")))
}

pub async fn silence_host(
    manager: &dyn SilenceManager,
    host: &str,
    duration: Duration,
    comment: &str,
    task_id: Option<&str>,
) -> Result<SilenceId, AlertError> {
    let request = SilenceRequest {
        matchers: vec![host_matcher(host)],
        duration,
        comment: silence_reason(comment, task_id),
    };
    let id = manager.create_silence(&request).await?;
    info!(host = host, silence = %id, "silenced host alerts for {:?}", duration);
    Ok(id)
}

/// Silences alerts by name and/or by extra matchers.
pub async fn silence_alert(
    manager: &dyn SilenceManager,
    alert_name: Option<&str>,
    extra_matchers: Vec<Matcher>,
    duration: Duration,
    comment: &str,
    task_id: Option<&str>,
) -> Result<SilenceId, AlertError> {
    let mut matchers = extra_matchers;
    if let Some(name) = alert_name.filter(|n| !n.is_empty()) {
        matchers.push(Matcher::equal("alertname", name));
    }
    let request = SilenceRequest {
        matchers,
        duration,
        comment: silence_reason(comment, task_id),
    };
    let id = manager.create_silence(&request).await?;
    info!(silence = %id, "created alert silence for {:?}", duration);
    Ok(id)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostableSilence<'a> {
    matchers: &'a [Matcher],
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    created_by: &'a str,
    comment: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostSilenceResponse {
    #[serde(rename = "silenceID")]
    silence_id: String,
}

/// [`SilenceManager`] over the Alertmanager v2 HTTP API.
pub struct AlertmanagerClient {
    base_url: String,
    created_by: String,
    client: reqwest::Client,
    dry_run: bool,
}

impl AlertmanagerClient {
    pub fn new(base_url: &str, created_by: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            created_by: created_by.to_string(),
            client,
            dry_run: false,
        }
    }

    /// In dry-run mode silences are logged, not created.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl SilenceManager for AlertmanagerClient {
    async fn create_silence(&self, request: &SilenceRequest) -> Result<SilenceId, AlertError> {
        let duration = chrono::Duration::from_std(request.duration)
            .map_err(|_| AlertError::InvalidDuration(request.duration))?;
        if self.dry_run {
            info!("dry-run: not creating silence for {:?}: {}", request.matchers, request.comment);
            return Ok(SilenceId::new("dry-run"));
        }
        let starts_at = Utc::now();
        let body = PostableSilence {
            matchers: &request.matchers,
            starts_at,
            ends_at: starts_at + duration,
            created_by: &self.created_by,
            comment: &request.comment,
        };

        let response = self
            .client
            .post(format!("{}/api/v2/silences", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let created: PostSilenceResponse = response.json().await?;
        Ok(SilenceId(created.silence_id))
    }

    async fn remove_silence(&self, id: &SilenceId) -> Result<(), AlertError> {
        if self.dry_run {
            info!(silence = %id, "dry-run: not removing silence");
            return Ok(());
        }
        let response = self
            .client
            .delete(format!("{}/api/v2/silence/{}", self.base_url, id))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            info!(silence = %id, "removed silence");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || body.contains("already expired") {
            debug!(silence = %id, "silence already gone: {}", body.trim());
            return Ok(());
        }
        Err(AlertError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
