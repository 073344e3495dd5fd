//! LLM adapter: given a failing CI step and the current repository contents,
//! ask the model for a source diff that repairs the build.
//!
//! "No fix produced" is a legitimate answer, not an error — the retry loop
//! simply stops for that failure and waits for the next CI signal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::RunningApp;
use crate::config::Config;
use crate::github::StepLog;
use crate::gitrepo::{RepoFile, RepoSnapshot};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// A set of file changes to push to the generated repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDiff {
    pub files: Vec<RepoFile>,
    #[serde(default)]
    pub deleted_files: Vec<String>,
    /// Human-readable commit message describing the fix.
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default)]
    no_fix: bool,
    #[serde(default)]
    files: Vec<RepoFile>,
    #[serde(default)]
    deleted_files: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

impl SourceDiff {
    /// Parse a model response into a diff, tolerating markdown fences around
    /// the JSON. Returns `Ok(None)` when the model declared it has no fix.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        // Extract the JSON object from markdown code blocks if present.
        let cleaned = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if start < end => &raw[start..=end],
            _ => raw,
        };
        let resp: FixResponse =
            serde_json::from_str(cleaned).context("failed to parse fix response as JSON")?;

        if resp.no_fix || resp.files.is_empty() && resp.deleted_files.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            files: resp.files,
            deleted_files: resp.deleted_files,
            message: resp.message.unwrap_or_else(|| "fix failing CI".to_string()),
        }))
    }
}

/// What the orchestrator needs from the code-repair model.
#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose_fix(
        &self,
        app: &RunningApp,
        files: &RepoSnapshot,
        failed_step: &StepLog,
    ) -> Result<Option<SourceDiff>>;
}

// ── Production implementation ────────────────────────────────────────

pub struct OpenAiFixer {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiFixer {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
        }
    }
}

const FIXER_SYSTEM_PROMPT: &str = r#"You repair failing CI builds of generated web applications.
You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "files": [{"path": "server/src/index.ts", "content": "full new file content"}],
  "deleted_files": ["paths/to/delete.ts"],
  "message": "one-line commit message describing the fix"
}
Include only files you changed or created. If you cannot produce a fix, respond with {"no_fix": true}.
"#;

#[async_trait]
impl FixProposer for OpenAiFixer {
    async fn propose_fix(
        &self,
        app: &RunningApp,
        files: &RepoSnapshot,
        failed_step: &StepLog,
    ) -> Result<Option<SourceDiff>> {
        let user_prompt = format!(
            "The app \"{}\" has a failing CI step \"{}\" in job \"{}\".\n\nFailing step log:\n{}\n\nCurrent repository files:\n{}\n\nPreviously deleted files (may be restored):\n{}",
            app.core.name,
            failed_step.step_name,
            failed_step.job_name,
            failed_step.log,
            serde_json::to_string(&files.files)?,
            serde_json::to_string(&files.deleted_files)?,
        );

        let resp: ChatResponse = self
            .client
            .post(OPENAI_CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": FIXER_SYSTEM_PROMPT},
                    {"role": "user", "content": user_prompt},
                ],
            }))
            .send()
            .await
            .context("failed to send fix request to OpenAI")?
            .error_for_status()
            .context("OpenAI API returned error status")?
            .json()
            .await
            .context("failed to parse OpenAI response")?;

        let content = resp
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .context("OpenAI response had no choices")?;

        SourceDiff::parse(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json_diff() {
        let diff = SourceDiff::parse(
            r#"{"files": [{"path": "a.ts", "content": "x"}], "deleted_files": [], "message": "fix type error"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.message, "fix type error");
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let raw = "Here is the fix:\n```json\n{\"files\": [{\"path\": \"a.ts\", \"content\": \"x\"}], \"message\": \"m\"}\n```";
        let diff = SourceDiff::parse(raw).unwrap().unwrap();
        assert_eq!(diff.files[0].path, "a.ts");
    }

    #[test]
    fn test_parse_no_fix_is_none() {
        assert!(SourceDiff::parse(r#"{"no_fix": true}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_empty_diff_is_none() {
        // A "fix" that touches nothing is treated as no fix produced.
        assert!(
            SourceDiff::parse(r#"{"files": [], "message": "nothing"}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_parse_deletion_only_diff_is_some() {
        let diff = SourceDiff::parse(r#"{"deleted_files": ["old.ts"], "message": "drop dead code"}"#)
            .unwrap()
            .unwrap();
        assert!(diff.files.is_empty());
        assert_eq!(diff.deleted_files, vec!["old.ts".to_string()]);
    }

    #[test]
    fn test_parse_garbage_is_an_error() {
        assert!(SourceDiff::parse("I don't know").is_err());
    }

    #[test]
    fn test_parse_defaults_commit_message() {
        let diff = SourceDiff::parse(r#"{"files": [{"path": "a", "content": "b"}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(diff.message, "fix failing CI");
    }
}
