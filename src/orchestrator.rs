//! App lifecycle orchestrator — the use-case layer gluing the pure domain
//! model to the store and the external adapters.
//!
//! Three entry points:
//! - [`Orchestrator::handle_webhook`]: per-delivery reconciliation of push
//!   and CI-run events. Errors propagate to the HTTP layer so the provider
//!   redelivers.
//! - [`Orchestrator::reconcile`]: the downtime sweep, run at startup and on
//!   every tunnel reconnect. Fans out one task per application; a single
//!   application's failure is logged and swallowed, never aborting the rest.
//! - [`Orchestrator::retry_failed_test`]: the automatic retry-and-repair
//!   loop for one application.
//!
//! Every read-modify-write re-loads the app inside its own transaction; the
//! snapshots passed between steps are only used for scanning, never written
//! back directly.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::app::{
    AppModel, Author, Bubble, InitApp, RunningApp, SystemStatus, WaitingApp, now_millis,
};
use crate::errors::OrchestratorError;
use crate::events::{AppEventKind, EventBus, PendingDispatch};
use crate::github::{self, CiHost, MAIN_REF, WebhookEvent, WebhookPayload, WorkflowRun};
use crate::gitrepo::SourceRepo;
use crate::llm::{FixProposer, SourceDiff};
use crate::store::{DbHandle, TxScope};

pub struct Orchestrator {
    db: DbHandle,
    ci: Arc<dyn CiHost>,
    llm: Arc<dyn FixProposer>,
    repo: Arc<dyn SourceRepo>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        ci: Arc<dyn CiHost>,
        llm: Arc<dyn FixProposer>,
        repo: Arc<dyn SourceRepo>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            ci,
            llm,
            repo,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Create ───────────────────────────────────────────────────────

    /// Create and persist a new application from a user's description.
    /// Index and queue position derive from counts taken inside the same
    /// transaction that writes the app, so concurrent creates cannot collide.
    pub async fn create_app(&self, author: Author, description: String) -> Result<AppModel> {
        let now = now_millis();
        let app = self
            .db
            .call(move |store| {
                store.in_tx(|tx| {
                    let app_count = tx.count_apps()?;
                    let waiting_count = tx.count_waiting()?;
                    let app = AppModel::Waiting(WaitingApp::create(
                        author,
                        app_count,
                        waiting_count,
                        &description,
                        now,
                    ));
                    tx.save(&app)?;
                    Ok(app)
                })
            })
            .await?;
        info!(
            display_id = app.display_id(),
            name = app.core().name,
            "created app"
        );
        Ok(app)
    }

    // ── Webhook reconciliation ───────────────────────────────────────

    /// Handle one inbound GitHub webhook delivery.
    pub async fn handle_webhook(&self, payload: WebhookPayload) -> Result<()> {
        match github::parse_webhook(payload) {
            WebhookEvent::Push {
                display_id,
                git_ref,
            } => self.dispatch_pushed_event(display_id, &git_ref).await,
            WebhookEvent::CiRun { display_id, run } => {
                self.update_workflow_run(display_id, run).await
            }
            WebhookEvent::Ignored => Ok(()),
        }
    }

    /// Emit `MainBranchPushed` for a push to main; pushes to other refs are
    /// ignored without touching the store. Dispatch happens strictly after
    /// the transaction that observed the app commits.
    async fn dispatch_pushed_event(&self, display_id: String, git_ref: &str) -> Result<()> {
        if git_ref != MAIN_REF {
            return Ok(());
        }

        let events = self.events.clone();
        let pending: PendingDispatch = self
            .db
            .call(move |store| {
                store.in_tx(|tx| {
                    let app = tx.find_by_display_id(&display_id)?;
                    Ok(events.create(AppEventKind::MainBranchPushed, &app))
                })
            })
            .await?;
        pending.dispatch_after_commit();
        Ok(())
    }

    /// Upsert one CI-run event into the app's log. Idempotent per run id, so
    /// webhook redeliveries are safe.
    async fn update_workflow_run(&self, display_id: String, run: WorkflowRun) -> Result<()> {
        let record = run.to_record();
        self.db
            .call(move |store| {
                store.in_tx(|tx| {
                    let app = tx.find_by_display_id(&display_id)?;
                    let app = app.upsert_github_bubbles(vec![record]);
                    tx.save(&app)
                })
            })
            .await
    }

    // ── Downtime reconciliation sweep ────────────────────────────────

    /// Replay CI state missed while the process was unreachable. One
    /// concurrent task per application; per-application errors never abort
    /// another application's pipeline.
    pub async fn reconcile(&self) {
        let apps = match self.db.call(|store| store.find_all()).await {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "reconciliation sweep could not list apps");
                return;
            }
        };

        info!(apps = apps.len(), "starting reconciliation sweep");
        join_all(apps.into_iter().map(|app| self.reconcile_app(app))).await;
    }

    async fn reconcile_app(&self, app: AppModel) {
        // Best effort: a broken webhook registration for one app must not
        // block reconciliation of its CI history.
        if let Err(e) = self.ci.reset_webhook(&app).await {
            warn!(display_id = app.display_id(), error = %e, "webhook re-registration failed");
        }

        let display_id = app.display_id().to_string();
        if let Err(e) = self.sync_runs_and_retry(app).await {
            warn!(display_id, error = %e, "reconciliation skipped for app");
        }
    }

    async fn sync_runs_and_retry(&self, app: AppModel) -> Result<()> {
        let runs = self.ci.list_all_runs(&app).await?;
        let id = app.id().to_string();
        let synced = self
            .db
            .call(move |store| {
                store.in_tx(|tx| {
                    let target = tx.find_by_id(&id)?;
                    let merged = target.upsert_github_bubbles(runs);
                    tx.save(&merged)?;
                    Ok(merged)
                })
            })
            .await?;
        self.retry_failed_test(synced).await
    }

    // ── Automatic retry-and-repair loop ──────────────────────────────

    /// Compare recorded retry attempts against failed CI runs and, when a
    /// failure has not been retried yet, ask the LLM for a fix and push it.
    ///
    /// The retry marker is persisted *before* the (slow) LLM call, so a crash
    /// mid-repair shows up on restart as "retried but not yet fixed" and the
    /// counts match — no duplicate retry on resume.
    pub async fn retry_failed_test(&self, app: AppModel) -> Result<()> {
        let bubbles = &app.core().bubbles;
        let retried = bubbles.iter().filter(|b| b.is_retry_marker()).count();
        let failed: Vec<_> = bubbles.iter().filter_map(Bubble::failed_run).collect();

        // Every known failure already triggered exactly one retry.
        if retried == failed.len() {
            return Ok(());
        }

        let last_failed = failed.last().copied().cloned().ok_or_else(|| {
            let err = OrchestratorError::MissingFailedRun {
                display_id: app.display_id().to_string(),
                retried,
            };
            error!(error = %err, "retry loop invariant violated");
            err
        })?;

        let failed_step = self.ci.find_failed_step(&app, &last_failed).await?;

        if !matches!(app, AppModel::Running(_)) {
            let err = OrchestratorError::RetryOnNonRunning {
                display_id: app.display_id().to_string(),
                status: app.status_str(),
            };
            error!(error = %err, "retry loop invariant violated");
            return Err(err.into());
        }

        let retrying = self.mark_retrying(app.id()).await?;
        info!(
            display_id = retrying.core.display_id,
            run_id = last_failed.id,
            step = failed_step.step_name,
            "retrying failed CI run"
        );

        let model = AppModel::Running(retrying.clone());
        let files = self.repo.get_files(&model).await?;
        match self.llm.propose_fix(&retrying, &files, &failed_step).await? {
            Some(diff) => self.push_fix(model, &diff).await,
            None => {
                info!(
                    display_id = retrying.core.display_id,
                    run_id = last_failed.id,
                    "no fix produced"
                );
                Ok(())
            }
        }
    }

    /// Transactionally append the retry marker to a *freshly loaded* snapshot
    /// (not the one the caller scanned), guarding against lost updates from
    /// concurrent webhook processing.
    async fn mark_retrying(&self, id: &str) -> Result<RunningApp> {
        let id = id.to_string();
        let now = now_millis();
        self.db
            .call(move |store| {
                store.in_tx(|tx| {
                    let running = match tx.find_by_id(&id)? {
                        AppModel::Running(running) => running,
                        other => {
                            return Err(OrchestratorError::RetryOnNonRunning {
                                display_id: other.display_id().to_string(),
                                status: other.status_str(),
                            }
                            .into());
                        }
                    };
                    let retrying = running.retry(now);
                    tx.save(&AppModel::Running(retrying.clone()))?;
                    Ok(retrying)
                })
            })
            .await
    }

    /// Push a produced diff to the generated repository and record it in the
    /// event log as an `ai` bubble carrying the commit message.
    pub async fn push_fix(&self, app: AppModel, diff: &SourceDiff) -> Result<()> {
        self.repo.push_diff(&app, diff).await?;

        let id = app.id().to_string();
        let message = format!("Pushed \"{}\" to GitHub.", diff.message);
        let now = now_millis();
        self.db
            .call(move |store| {
                store.in_tx(|tx| {
                    let app = tx.find_by_id(&id)?.add_bubble(Bubble::ai(message, now));
                    tx.save(&app)
                })
            })
            .await
    }

    // ── Provisioning hooks ───────────────────────────────────────────

    /// Mark GitHub provisioning as finished for an app being initialized: the
    /// `completed_github` marker is written inside the caller's transaction
    /// and a `GitHubCreated` event is staged for dispatch after it commits.
    pub fn complete_github_init(
        &self,
        tx: &TxScope<'_>,
        inited: InitApp,
        now: i64,
    ) -> Result<PendingDispatch> {
        let app = AppModel::Init(inited).add_bubble(Bubble::system(SystemStatus::CompletedGithub, now));
        tx.save(&app)?;
        Ok(self.events.create(AppEventKind::GitHubCreated, &app))
    }
}
