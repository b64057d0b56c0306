use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PlannerError;
use crate::types::{Action, TaskState};

/// One planner round trip request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerRequest {
    pub session_id: String,
    /// The user's words, or the follow-up sentinel.
    pub user_text: String,
    pub screen_context: String,
    /// Serialized device status.
    pub status: String,
    pub task_state: TaskState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerResponse {
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_actions")]
    pub actions: Vec<Action>,
}

impl PlannerResponse {
    /// Neither speech nor actions: the planner had nothing to say.
    pub fn is_silent(&self) -> bool {
        self.actions.is_empty()
            && self
                .reply_text
                .as_deref()
                .is_none_or(|t| sanitize_reply(t).is_empty())
    }
}

/// Unknown or malformed actions are dropped one by one instead of failing the reply.
fn lenient_actions<'de, D>(deserializer: D) -> Result<Vec<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Action>(value.clone()) {
            Ok(action) => Some(action),
            Err(e) => {
                warn!(%value, "skipping planner action: {e}");
                None
            }
        })
        .collect())
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlannerRequest) -> Result<PlannerResponse, PlannerError>;
}

/// JSON-over-HTTP planner client.
pub struct HttpPlanner {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPlanner {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PlannerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, request: PlannerRequest) -> Result<PlannerResponse, PlannerError> {
        debug!(
            session = %request.session_id,
            step = request.task_state.step,
            "calling planner"
        );
        let mut call = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(%status, "planner returned an error status");
            return Err(PlannerError::Status {
                code: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        // Some planners wrap their JSON in markdown fences.
        let cleaned = body
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if cleaned.is_empty() {
            return Ok(PlannerResponse::default());
        }
        Ok(serde_json::from_str(cleaned)?)
    }
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[a-zA-Z]*").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*+]\s+").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~]+").unwrap());
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Reply text made fit for speech: markdown and HTML removed, whitespace collapsed.
pub fn sanitize_reply(text: &str) -> String {
    let text = CODE_FENCE.replace_all(text, " ");
    let text = LINK.replace_all(&text, "$1");
    let text = HTML_TAG.replace_all(&text, " ");
    let text = HEADING.replace_all(&text, "");
    let text = BULLET.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    SPACES.replace_all(&text, " ").trim().to_string()
}
