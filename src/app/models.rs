use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bubbles::{
    Bubble, DeploymentRecord, SystemStatus, WorkflowRunRecord, upsert_github, upsert_railway,
};

/// Base domain generated apps are served under; the display id becomes the
/// subdomain.
pub const BASE_DOMAIN: &str = "atelier-apps.dev";

/// GitHub organization holding the generated repositories.
pub const GITHUB_OWNER: &str = "atelier-apps";

pub type AppId = String;

/// The user who asked for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub user_id: String,
    pub github_id: String,
    pub name: String,
    pub photo_url: Option<String>,
}

/// Where a running application is reachable, derived from its index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUrls {
    pub site: String,
    pub github: String,
}

/// OGP card image generated for the app's landing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OgpImage {
    pub url: String,
}

/// Provisioned deployment target on the hosting provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailwayDeployment {
    pub project_id: String,
    pub service_id: String,
    pub environment_id: String,
}

/// Fields every lifecycle stage carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCore {
    pub id: AppId,
    pub author: Author,
    pub index: i64,
    pub display_id: String,
    pub name: String,
    pub created_time: i64,
    pub bubbles: Vec<Bubble>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingApp {
    #[serde(flatten)]
    pub core: AppCore,
    /// 1-based queue position among all waiting apps.
    pub waiting_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitApp {
    #[serde(flatten)]
    pub core: AppCore,
    /// Cleared by [`WaitingApp::init`]; kept as a field so a snapshot taken
    /// mid-transition still deserializes.
    pub waiting_order: Option<i64>,
    pub ogp_image: Option<OgpImage>,
    pub railway: Option<RailwayDeployment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningApp {
    #[serde(flatten)]
    pub core: AppCore,
    pub urls: AppUrls,
    pub ogp_image: OgpImage,
    pub railway: RailwayDeployment,
}

/// An application at some point in its one-directional lifecycle:
/// waiting → init → running.
///
/// Transitions are pure functions on the stage-specific structs; callers pick
/// the operation matching the stage they hold, so a backward or skipped
/// transition does not typecheck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppModel {
    Waiting(WaitingApp),
    Init(InitApp),
    Running(RunningApp),
}

/// Fixed encoding from insertion index to the external routing key.
pub fn index_to_display_id(index: i64) -> String {
    format!("app-{}", to_base36(index))
}

pub fn index_to_urls(index: i64) -> AppUrls {
    let display_id = index_to_display_id(index);
    AppUrls {
        site: format!("https://{}.{}", display_id, BASE_DOMAIN),
        github: format!("https://github.com/{}/{}", GITHUB_OWNER, display_id),
    }
}

fn to_base36(mut n: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize] as char);
        n /= 36;
    }
    out.into_iter().rev().collect()
}

impl WaitingApp {
    /// Create a fresh application from a user's free-text description.
    ///
    /// `app_count` and `waiting_count` are the current totals at creation
    /// time; the new app's index and queue position derive from them. The
    /// seed bubbles get strictly increasing timestamps so log order is
    /// stable, and a `waiting_init` marker is added only when the app has to
    /// queue behind others.
    pub fn create(
        author: Author,
        app_count: i64,
        waiting_count: i64,
        description: &str,
        now: i64,
    ) -> Self {
        let index = app_count + 1;
        let mut bubbles = vec![
            Bubble::system(SystemStatus::FirstQuestion, now),
            Bubble::human(description, now + 1),
        ];
        if waiting_count > 0 {
            bubbles.push(Bubble::system(SystemStatus::WaitingInit, now + 2));
        }

        Self {
            core: AppCore {
                id: Uuid::new_v4().to_string(),
                author,
                index,
                display_id: index_to_display_id(index),
                name: description.chars().take(15).collect(),
                created_time: now,
                bubbles,
            },
            waiting_order: waiting_count + 1,
        }
    }

    /// Leave the waiting queue and start provisioning infrastructure.
    pub fn init(self, now: i64) -> InitApp {
        let mut core = self.core;
        core.bubbles.push(Bubble::system(SystemStatus::InitInfra, now));
        InitApp {
            core,
            waiting_order: None,
            ogp_image: None,
            railway: None,
        }
    }
}

impl InitApp {
    pub fn set_ogp(self, ogp_image: OgpImage) -> Self {
        Self {
            ogp_image: Some(ogp_image),
            ..self
        }
    }

    pub fn set_railway(self, railway: RailwayDeployment) -> Self {
        Self {
            railway: Some(railway),
            ..self
        }
    }

    /// Go live. Both deployment artifacts are required here even though they
    /// are optional while initializing.
    pub fn run(self, ogp_image: OgpImage, railway: RailwayDeployment) -> RunningApp {
        let urls = index_to_urls(self.core.index);
        RunningApp {
            core: self.core,
            urls,
            ogp_image,
            railway,
        }
    }
}

impl RunningApp {
    /// Record one automatic retry attempt against a failing CI run.
    pub fn retry(mut self, now: i64) -> Self {
        self.core
            .bubbles
            .push(Bubble::system(SystemStatus::RetryTest, now));
        self
    }
}

impl AppModel {
    pub fn core(&self) -> &AppCore {
        match self {
            Self::Waiting(app) => &app.core,
            Self::Init(app) => &app.core,
            Self::Running(app) => &app.core,
        }
    }

    fn core_mut(&mut self) -> &mut AppCore {
        match self {
            Self::Waiting(app) => &mut app.core,
            Self::Init(app) => &mut app.core,
            Self::Running(app) => &mut app.core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    pub fn display_id(&self) -> &str {
        &self.core().display_id
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Waiting(_) => "waiting",
            Self::Init(_) => "init",
            Self::Running(_) => "running",
        }
    }

    /// Append a bubble, preserving the stage-specific shape.
    pub fn add_bubble(mut self, bubble: Bubble) -> Self {
        self.core_mut().bubbles.push(bubble);
        self
    }

    /// Upsert CI runs into the event log, keyed by run id.
    pub fn upsert_github_bubbles(mut self, runs: Vec<WorkflowRunRecord>) -> Self {
        upsert_github(&mut self.core_mut().bubbles, runs);
        self
    }

    /// Upsert deployment events into the event log, keyed by deployment id.
    pub fn upsert_railway_bubbles(mut self, events: Vec<DeploymentRecord>) -> Self {
        upsert_railway(&mut self.core_mut().bubbles, events);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn author() -> Author {
        Author {
            user_id: "u1".to_string(),
            github_id: "octocat".to_string(),
            name: "Octo Cat".to_string(),
            photo_url: None,
        }
    }

    #[test]
    fn test_create_with_empty_queue_seeds_two_bubbles() {
        let app = WaitingApp::create(author(), 0, 0, "a todo list with tags", 100);

        assert_eq!(app.core.bubbles.len(), 2);
        assert_eq!(
            app.core.bubbles[0],
            Bubble::system(SystemStatus::FirstQuestion, 100)
        );
        assert_eq!(
            app.core.bubbles[1],
            Bubble::human("a todo list with tags", 101)
        );
        assert_eq!(app.waiting_order, 1);
        assert_eq!(app.core.index, 1);
    }

    #[test]
    fn test_create_behind_queue_appends_waiting_marker() {
        let app = WaitingApp::create(author(), 7, 3, "recipe sharing site", 100);

        assert_eq!(app.core.bubbles.len(), 3);
        assert_eq!(
            app.core.bubbles[2],
            Bubble::system(SystemStatus::WaitingInit, 102)
        );
        assert_eq!(app.waiting_order, 4);
        assert_eq!(app.core.index, 8);
    }

    #[test]
    fn test_create_truncates_name_to_15_chars() {
        let app = WaitingApp::create(author(), 0, 0, "a very long description of my dream app", 0);
        assert_eq!(app.core.name.chars().count(), 15);
        assert_eq!(app.core.name, "a very long des");

        // Multibyte input must not split a character.
        let app = WaitingApp::create(author(), 0, 0, "日本語のとても長い説明文をここに書きます", 0);
        assert_eq!(app.core.name.chars().count(), 15);
    }

    #[test]
    fn test_display_id_encoding_is_stable() {
        assert_eq!(index_to_display_id(1), "app-1");
        assert_eq!(index_to_display_id(36), "app-10");
        assert_eq!(index_to_display_id(1295), "app-zz");
    }

    #[test]
    fn test_urls_derive_from_display_id() {
        let urls = index_to_urls(36);
        assert_eq!(urls.site, "https://app-10.atelier-apps.dev");
        assert_eq!(urls.github, "https://github.com/atelier-apps/app-10");
    }

    #[test]
    fn test_init_clears_waiting_order_and_marks_infra() {
        let app = WaitingApp::create(author(), 0, 2, "blog", 0).init(50);

        assert_eq!(app.waiting_order, None);
        assert_eq!(
            app.core.bubbles.last(),
            Some(&Bubble::system(SystemStatus::InitInfra, 50))
        );
    }

    #[test]
    fn test_run_requires_both_artifacts_and_derives_urls() {
        let ogp = OgpImage {
            url: "https://cdn.example/ogp.png".to_string(),
        };
        let railway = RailwayDeployment {
            project_id: "p".to_string(),
            service_id: "s".to_string(),
            environment_id: "e".to_string(),
        };
        let running = WaitingApp::create(author(), 0, 0, "shop", 0)
            .init(1)
            .run(ogp.clone(), railway.clone());

        assert_eq!(running.urls, index_to_urls(running.core.index));
        assert_eq!(running.ogp_image, ogp);
        assert_eq!(running.railway, railway);
    }

    #[test]
    fn test_status_tag_round_trips_through_json() {
        let app = AppModel::Waiting(WaitingApp::create(author(), 0, 0, "pets", 0));
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["waiting_order"], 1);

        let back: AppModel = serde_json::from_value(json).unwrap();
        assert_eq!(back, app);
        assert_eq!(back.status_str(), "waiting");
    }

    #[test]
    fn test_add_bubble_preserves_stage() {
        let app = AppModel::Waiting(WaitingApp::create(author(), 0, 0, "pets", 0));
        let app = app.add_bubble(Bubble::ai("working on it", 9));
        assert!(matches!(app, AppModel::Waiting(_)));
        assert_eq!(app.core().bubbles.len(), 3);
    }

    #[test]
    fn test_retry_appends_retry_marker() {
        let running = WaitingApp::create(author(), 0, 0, "shop", 0)
            .init(1)
            .run(
                OgpImage {
                    url: "u".to_string(),
                },
                RailwayDeployment {
                    project_id: "p".to_string(),
                    service_id: "s".to_string(),
                    environment_id: "e".to_string(),
                },
            )
            .retry(77);
        assert!(running.core.bubbles.last().unwrap().is_retry_marker());
    }
}
