//! GitHub integration: webhook payload parsing and the CI host adapter.
//!
//! The webhook endpoint receives two payload shapes we care about — a push
//! event (carries `ref`) and a workflow-run event (carries `workflow_run`).
//! `repository.name` doubles as the application's display id because every
//! generated repo is named after it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::app::{AppModel, WorkflowRunRecord};
use crate::config::Config;

pub const MAIN_REF: &str = "refs/heads/main";

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "atelier-factory";

// ── Webhook payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub workflow_run: Option<WorkflowRun>,
    pub repository: WebhookRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    pub name: String,
}

/// A workflow run as GitHub delivers it (subset of fields we care about).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub name: String,
    pub head_branch: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub message: String,
}

impl WorkflowRun {
    pub fn to_record(&self) -> WorkflowRunRecord {
        WorkflowRunRecord {
            id: self.id,
            name: self.name.clone(),
            head_branch: self.head_branch.clone(),
            commit_message: self
                .head_commit
                .as_ref()
                .map(|c| c.message.clone())
                .unwrap_or_default(),
            status: self.status.clone(),
            conclusion: self.conclusion.clone(),
            html_url: self.html_url.clone(),
            created_time: self.created_at.timestamp_millis(),
            updated_time: self.updated_at.timestamp_millis(),
        }
    }
}

/// What a webhook delivery means to the orchestrator.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Push { display_id: String, git_ref: String },
    CiRun { display_id: String, run: WorkflowRun },
    Ignored,
}

pub fn parse_webhook(payload: WebhookPayload) -> WebhookEvent {
    let display_id = payload.repository.name;
    if let Some(git_ref) = payload.git_ref {
        return WebhookEvent::Push {
            display_id,
            git_ref,
        };
    }
    match payload.workflow_run {
        Some(run) => WebhookEvent::CiRun { display_id, run },
        None => WebhookEvent::Ignored,
    }
}

// ── CI host port ─────────────────────────────────────────────────────

/// Log of the failing step inside a failing workflow run.
#[derive(Debug, Clone)]
pub struct StepLog {
    pub job_name: String,
    pub step_name: String,
    pub log: String,
}

/// What the orchestrator needs from the CI provider.
#[async_trait]
pub trait CiHost: Send + Sync {
    /// Full workflow-run history for an app's repository.
    async fn list_all_runs(&self, app: &AppModel) -> Result<Vec<WorkflowRunRecord>>;

    /// Locate the failed step of a failing run and fetch its log.
    /// Errors when the run has no failed step.
    async fn find_failed_step(&self, app: &AppModel, run: &WorkflowRunRecord) -> Result<StepLog>;

    /// Re-register our webhook endpoint on the app's repository.
    /// Idempotent; safe to call on every reconciliation sweep.
    async fn reset_webhook(&self, app: &AppModel) -> Result<()>;
}

// ── Production implementation ────────────────────────────────────────

pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    owner: String,
    webhook_url: String,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: i64,
    name: String,
    conclusion: Option<String>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct Step {
    name: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: i64,
    config: HookConfig,
}

#[derive(Debug, Deserialize)]
struct HookConfig {
    url: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: config.github_token.clone(),
            owner: config.github_owner.clone(),
            webhook_url: config.webhook_url.clone(),
        }
    }

    fn repo_url(&self, app: &AppModel, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            GITHUB_API,
            self.owner,
            app.display_id(),
            tail
        )
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
    }
}

#[async_trait]
impl CiHost for GitHubClient {
    async fn list_all_runs(&self, app: &AppModel) -> Result<Vec<WorkflowRunRecord>> {
        let url = self.repo_url(app, "/actions/runs");
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let resp: RunsPage = self
                .get(&url)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await
                .context("failed to send workflow runs request to GitHub")?
                .error_for_status()
                .context("GitHub workflow runs API returned error status")?
                .json()
                .await
                .context("failed to parse workflow runs response from GitHub")?;

            let count = resp.workflow_runs.len();
            all.extend(resp.workflow_runs.iter().map(WorkflowRun::to_record));

            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn find_failed_step(&self, app: &AppModel, run: &WorkflowRunRecord) -> Result<StepLog> {
        let url = self.repo_url(app, &format!("/actions/runs/{}/jobs", run.id));
        let jobs: JobsPage = self
            .get(&url)
            .send()
            .await
            .context("failed to send jobs request to GitHub")?
            .error_for_status()
            .context("GitHub jobs API returned error status")?
            .json()
            .await
            .context("failed to parse jobs response from GitHub")?;

        let job = jobs
            .jobs
            .iter()
            .find(|j| j.conclusion.as_deref() == Some("failure"))
            .with_context(|| format!("run {} has no failed job", run.id))?;
        let step = job
            .steps
            .iter()
            .find(|s| s.conclusion.as_deref() == Some("failure"))
            .with_context(|| format!("job '{}' has no failed step", job.name))?;

        let log_url = self.repo_url(app, &format!("/actions/jobs/{}/logs", job.id));
        let log = self
            .get(&log_url)
            .send()
            .await
            .context("failed to fetch job log from GitHub")?
            .error_for_status()
            .context("GitHub job log API returned error status")?
            .text()
            .await
            .context("failed to read job log body")?;

        Ok(StepLog {
            job_name: job.name.clone(),
            step_name: step.name.clone(),
            log,
        })
    }

    async fn reset_webhook(&self, app: &AppModel) -> Result<()> {
        // Drop any hook already pointing at us, then register a fresh one.
        let hooks_url = self.repo_url(app, "/hooks");
        let hooks: Vec<Hook> = self
            .get(&hooks_url)
            .send()
            .await
            .context("failed to list repository hooks")?
            .error_for_status()
            .context("GitHub hooks API returned error status")?
            .json()
            .await
            .context("failed to parse hooks response")?;

        for hook in hooks
            .iter()
            .filter(|h| h.config.url.as_deref() == Some(self.webhook_url.as_str()))
        {
            self.client
                .delete(format!("{}/{}", hooks_url, hook.id))
                .header("Authorization", format!("Bearer {}", self.token))
                .header("User-Agent", USER_AGENT)
                .send()
                .await
                .context("failed to delete stale hook")?
                .error_for_status()
                .context("GitHub hook deletion returned error status")?;
        }

        self.client
            .post(&hooks_url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({
                "config": { "url": self.webhook_url, "content_type": "json" },
                "events": ["push", "workflow_run"],
                "active": true,
            }))
            .send()
            .await
            .context("failed to create hook")?
            .error_for_status()
            .context("GitHub hook creation returned error status")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> WebhookPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_push_payload() {
        let event = parse_webhook(payload(
            r#"{"ref": "refs/heads/main", "repository": {"name": "app-7"}}"#,
        ));
        match event {
            WebhookEvent::Push {
                display_id,
                git_ref,
            } => {
                assert_eq!(display_id, "app-7");
                assert_eq!(git_ref, MAIN_REF);
            }
            other => panic!("expected push event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_non_main_push_is_still_a_push() {
        // Branch filtering is the orchestrator's call, not the parser's.
        let event = parse_webhook(payload(
            r#"{"ref": "refs/heads/develop", "repository": {"name": "app-7"}}"#,
        ));
        assert!(matches!(event, WebhookEvent::Push { git_ref, .. } if git_ref == "refs/heads/develop"));
    }

    #[test]
    fn test_parse_workflow_run_payload() {
        let event = parse_webhook(payload(
            r#"{
                "workflow_run": {
                    "id": 42,
                    "name": "CI",
                    "head_branch": "main",
                    "status": "completed",
                    "conclusion": "failure",
                    "html_url": "https://github.com/o/app-7/actions/runs/42",
                    "created_at": "2024-01-01T00:00:00Z",
                    "updated_at": "2024-01-01T00:05:00Z",
                    "head_commit": {"message": "fix: handle empty input"}
                },
                "repository": {"name": "app-7"}
            }"#,
        ));
        match event {
            WebhookEvent::CiRun { display_id, run } => {
                assert_eq!(display_id, "app-7");
                let record = run.to_record();
                assert_eq!(record.id, 42);
                assert!(record.concluded_failure());
                assert_eq!(record.commit_message, "fix: handle empty input");
                assert_eq!(record.created_time, 1_704_067_200_000);
            }
            other => panic!("expected CI run event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unrelated_payload_is_ignored() {
        let event = parse_webhook(payload(r#"{"repository": {"name": "app-7"}}"#));
        assert!(matches!(event, WebhookEvent::Ignored));
    }

    #[test]
    fn test_to_record_without_head_commit() {
        let run: WorkflowRun = serde_json::from_str(
            r#"{
                "id": 1,
                "name": "CI",
                "head_branch": "main",
                "status": "in_progress",
                "conclusion": null,
                "html_url": "https://github.com/o/r/actions/runs/1",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        let record = run.to_record();
        assert_eq!(record.commit_message, "");
        assert!(!record.concluded_failure());
    }
}
