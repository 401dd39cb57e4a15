//! External issue source.
//!
//! The tracker is read through the blocking [`IssueSource`] trait. The HTTP
//! implementation reads `GET {base_url}/sprints/{id}/issues` and expects:
//!
//! ```json
//! { "sprint": { "id": "PAY-S12", "state": "active" }, "issues": [ ... ] }
//! ```
//!
//! Status mapping: 5xx, 408 and 429 are transient; 401, 403, 404 and every
//! other 4xx are permanent. Transport errors and timeouts are transient. An
//! unreadable body is permanent.

use std::time::Duration;

use serde::Deserialize;

use sprintsync_core::config::SourceSettings;
use sprintsync_core::types::{Issue, SprintId, SprintState};

use crate::error::FetchError;

/// Issues of one sprint as read from the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSprint {
    pub sprint_id: SprintId,
    pub state: SprintState,
    pub issues: Vec<Issue>,
}

pub trait IssueSource: Send + Sync {
    fn fetch_sprint_issues(&self, sprint: &SprintId) -> Result<RemoteSprint, FetchError>;
}

#[derive(Debug, Deserialize)]
struct SprintHeader {
    id: SprintId,
    #[serde(default)]
    state: SprintState,
}

#[derive(Debug, Deserialize)]
struct SprintIssuesPayload {
    sprint: SprintHeader,
    #[serde(default)]
    issues: Vec<Issue>,
}

/// Issue source backed by the tracker's HTTP API.
pub struct HttpIssueSource {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl HttpIssueSource {
    pub fn new(settings: &SourceSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build();
        Self {
            agent,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        }
    }

    pub fn url_for(&self, sprint: &SprintId) -> String {
        format!("{}/sprints/{}/issues", self.base_url, encode_segment(&sprint.0))
    }
}

impl IssueSource for HttpIssueSource {
    fn fetch_sprint_issues(&self, sprint: &SprintId) -> Result<RemoteSprint, FetchError> {
        let url = self.url_for(sprint);
        let mut request = self.agent.get(&url).set("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        let response = request.call().map_err(|err| classify(&url, err))?;
        let payload: SprintIssuesPayload = response.into_json().map_err(|err| {
            if err.kind() == std::io::ErrorKind::InvalidData {
                FetchError::Permanent(format!("malformed response from {url}: {err}"))
            } else {
                FetchError::Transient(format!("reading response from {url}: {err}"))
            }
        })?;

        if &payload.sprint.id != sprint {
            return Err(FetchError::Permanent(format!(
                "{url} returned sprint {} instead of {sprint}",
                payload.sprint.id
            )));
        }
        Ok(RemoteSprint {
            sprint_id: payload.sprint.id,
            state: payload.sprint.state,
            issues: payload.issues,
        })
    }
}

fn classify(url: &str, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(code, response) => {
            let message = format!("{url} returned HTTP {code} {}", response.status_text());
            classify_status(code, message)
        }
        ureq::Error::Transport(transport) => {
            FetchError::Transient(format!("request to {url} failed: {transport}"))
        }
    }
}

/// Map an HTTP error status to a fetch error.
pub fn classify_status(code: u16, message: String) -> FetchError {
    match code {
        408 | 429 => FetchError::Transient(message),
        500..=599 => FetchError::Transient(message),
        _ => FetchError::Permanent(message),
    }
}

/// Percent-encode everything outside RFC 3986 unreserved characters.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
