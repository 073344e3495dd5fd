use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current time in epoch milliseconds, the unit every bubble timestamp uses.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fixed vocabulary of lifecycle markers recorded as `system` bubbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    FirstQuestion,
    WaitingInit,
    InitInfra,
    CompletedGithub,
    CompletedRailway,
    RetryTest,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstQuestion => "first_question",
            Self::WaitingInit => "waiting_init",
            Self::InitInfra => "init_infra",
            Self::CompletedGithub => "completed_github",
            Self::CompletedRailway => "completed_railway",
            Self::RetryTest => "retry_test",
        }
    }
}

/// A CI workflow run as recorded inside a `github` bubble.
/// `id` is GitHub's run id and is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub id: i64,
    pub name: String,
    pub head_branch: String,
    pub commit_message: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_time: i64,
    pub updated_time: i64,
}

impl WorkflowRunRecord {
    pub fn concluded_failure(&self) -> bool {
        self.conclusion.as_deref() == Some("failure")
    }
}

/// A deployment event as recorded inside a `railway` bubble.
/// `id` is the provider's deployment id and is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub status: String,
    pub url: Option<String>,
    pub created_time: i64,
    pub updated_time: i64,
}

/// One entry in an application's event log.
///
/// The log is append-only except for `Github` and `Railway` bubbles: when a
/// newer event arrives for an external id the log already knows, the wrapped
/// content is replaced in place and the bubble keeps its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bubble {
    System {
        content: SystemStatus,
        created_time: i64,
    },
    Ai {
        content: String,
        created_time: i64,
    },
    Human {
        content: String,
        created_time: i64,
    },
    Github {
        content: WorkflowRunRecord,
        created_time: i64,
    },
    Railway {
        content: DeploymentRecord,
        created_time: i64,
    },
}

impl Bubble {
    pub fn system(content: SystemStatus, created_time: i64) -> Self {
        Self::System {
            content,
            created_time,
        }
    }

    pub fn ai(content: impl Into<String>, created_time: i64) -> Self {
        Self::Ai {
            content: content.into(),
            created_time,
        }
    }

    pub fn human(content: impl Into<String>, created_time: i64) -> Self {
        Self::Human {
            content: content.into(),
            created_time,
        }
    }

    pub fn github(content: WorkflowRunRecord) -> Self {
        let created_time = content.created_time;
        Self::Github {
            content,
            created_time,
        }
    }

    pub fn railway(content: DeploymentRecord) -> Self {
        let created_time = content.created_time;
        Self::Railway {
            content,
            created_time,
        }
    }

    /// Whether this bubble marks one automatic retry attempt.
    pub fn is_retry_marker(&self) -> bool {
        matches!(
            self,
            Self::System {
                content: SystemStatus::RetryTest,
                ..
            }
        )
    }

    /// The wrapped CI run, if this is a `github` bubble that concluded in failure.
    pub fn failed_run(&self) -> Option<&WorkflowRunRecord> {
        match self {
            Self::Github { content, .. } if content.concluded_failure() => Some(content),
            _ => None,
        }
    }
}

/// Merge incoming CI runs into the log, keyed by run id: known ids are
/// replaced in place, the rest are appended in input order. Untouched
/// bubbles keep their relative order.
pub(crate) fn upsert_github(bubbles: &mut Vec<Bubble>, incoming: Vec<WorkflowRunRecord>) {
    let mut fresh = Vec::new();
    for run in incoming {
        let existing = bubbles.iter_mut().find_map(|b| match b {
            Bubble::Github { content, .. } if content.id == run.id => Some(content),
            _ => None,
        });
        match existing {
            Some(content) => *content = run,
            None => fresh.push(run),
        }
    }
    bubbles.extend(fresh.into_iter().map(Bubble::github));
}

/// Same merge strategy as [`upsert_github`], keyed by deployment id.
pub(crate) fn upsert_railway(bubbles: &mut Vec<Bubble>, incoming: Vec<DeploymentRecord>) {
    let mut fresh = Vec::new();
    for event in incoming {
        let existing = bubbles.iter_mut().find_map(|b| match b {
            Bubble::Railway { content, .. } if content.id == event.id => Some(content),
            _ => None,
        });
        match existing {
            Some(content) => *content = event,
            None => fresh.push(event),
        }
    }
    bubbles.extend(fresh.into_iter().map(Bubble::railway));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: i64, conclusion: Option<&str>) -> WorkflowRunRecord {
        WorkflowRunRecord {
            id,
            name: "CI".to_string(),
            head_branch: "main".to_string(),
            commit_message: "commit".to_string(),
            status: "completed".to_string(),
            conclusion: conclusion.map(str::to_string),
            html_url: format!("https://github.com/o/r/actions/runs/{}", id),
            created_time: 1_000 + id,
            updated_time: 2_000 + id,
        }
    }

    fn deployment(id: &str, status: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            status: status.to_string(),
            url: None,
            created_time: 10,
            updated_time: 20,
        }
    }

    #[test]
    fn test_system_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SystemStatus::FirstQuestion).unwrap(),
            "\"first_question\""
        );
        assert_eq!(
            serde_json::to_string(&SystemStatus::RetryTest).unwrap(),
            "\"retry_test\""
        );
    }

    #[test]
    fn test_bubble_serializes_with_type_tag() {
        let json = serde_json::to_value(Bubble::human("make me a todo app", 5)).unwrap();
        assert_eq!(json["type"], "human");
        assert_eq!(json["content"], "make me a todo app");
        assert_eq!(json["created_time"], 5);
    }

    #[test]
    fn test_github_bubble_roundtrip() {
        let bubble = Bubble::github(run(7, Some("failure")));
        let json = serde_json::to_string(&bubble).unwrap();
        let back: Bubble = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bubble);
        assert!(back.failed_run().is_some());
    }

    #[test]
    fn test_failed_run_ignores_success() {
        assert!(Bubble::github(run(1, Some("success"))).failed_run().is_none());
        assert!(Bubble::github(run(2, None)).failed_run().is_none());
        assert!(Bubble::human("hi", 0).failed_run().is_none());
    }

    #[test]
    fn test_upsert_appends_new_runs_in_input_order() {
        let mut bubbles = vec![Bubble::system(SystemStatus::FirstQuestion, 0)];
        upsert_github(&mut bubbles, vec![run(2, None), run(1, None)]);

        assert_eq!(bubbles.len(), 3);
        match (&bubbles[1], &bubbles[2]) {
            (Bubble::Github { content: a, .. }, Bubble::Github { content: b, .. }) => {
                assert_eq!(a.id, 2);
                assert_eq!(b.id, 1);
            }
            other => panic!("expected two github bubbles, got {:?}", other),
        }
    }

    #[test]
    fn test_upsert_replaces_in_place_and_preserves_position() {
        let mut bubbles = vec![
            Bubble::github(run(1, None)),
            Bubble::human("hello", 3),
            Bubble::github(run(2, None)),
        ];
        upsert_github(&mut bubbles, vec![run(1, Some("failure"))]);

        assert_eq!(bubbles.len(), 3);
        match &bubbles[0] {
            Bubble::Github { content, .. } => {
                assert_eq!(content.id, 1);
                assert_eq!(content.conclusion.as_deref(), Some("failure"));
            }
            other => panic!("expected github bubble first, got {:?}", other),
        }
        assert_eq!(bubbles[1], Bubble::human("hello", 3));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut once = vec![Bubble::system(SystemStatus::FirstQuestion, 0)];
        let incoming = vec![run(1, Some("success")), run(2, Some("failure"))];
        upsert_github(&mut once, incoming.clone());

        let mut twice = once.clone();
        upsert_github(&mut twice, incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upsert_second_conclusion_wins_without_duplicating() {
        let mut bubbles = Vec::new();
        upsert_github(&mut bubbles, vec![run(9, None)]);
        upsert_github(&mut bubbles, vec![run(9, Some("failure"))]);

        let github: Vec<_> = bubbles
            .iter()
            .filter_map(|b| match b {
                Bubble::Github { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(github.len(), 1);
        assert_eq!(github[0].conclusion.as_deref(), Some("failure"));
    }

    #[test]
    fn test_upsert_railway_replaces_by_deployment_id() {
        let mut bubbles = vec![Bubble::railway(deployment("d1", "building"))];
        upsert_railway(&mut bubbles, vec![deployment("d1", "success"), deployment("d2", "building")]);

        assert_eq!(bubbles.len(), 2);
        match &bubbles[0] {
            Bubble::Railway { content, .. } => assert_eq!(content.status, "success"),
            other => panic!("expected railway bubble, got {:?}", other),
        }
    }
}
