//! Domain-event bus with commit-then-notify ordering.
//!
//! Events are created *inside* a store transaction but dispatched only after
//! it commits: [`EventBus::create`] returns a [`PendingDispatch`] handle the
//! caller invokes once the transaction is over. Observers therefore never see
//! an event whose causing write did not survive.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::app::AppModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEventKind {
    MainBranchPushed,
    #[serde(rename = "github_created")]
    GitHubCreated,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppEvent {
    pub kind: AppEventKind,
    /// Snapshot of the app as written by the transaction that caused the event.
    pub app: AppModel,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Stage an event for dispatch after the enclosing transaction commits.
    pub fn create(&self, kind: AppEventKind, app: &AppModel) -> PendingDispatch {
        PendingDispatch {
            tx: self.tx.clone(),
            event: AppEvent {
                kind,
                app: app.clone(),
            },
        }
    }
}

/// A staged event. Dropping it without calling
/// [`dispatch_after_commit`](Self::dispatch_after_commit) discards the event,
/// which is exactly right when the transaction rolled back.
#[must_use = "the event is not delivered until dispatch_after_commit() is called"]
pub struct PendingDispatch {
    tx: broadcast::Sender<AppEvent>,
    event: AppEvent,
}

impl PendingDispatch {
    pub fn dispatch_after_commit(self) {
        tracing::debug!(kind = ?self.event.kind, display_id = self.event.app.display_id(), "dispatching app event");
        // No subscribers is fine; the send result only reports that.
        let _ = self.tx.send(self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Author, WaitingApp};
    use tokio::sync::broadcast::error::TryRecvError;

    fn app() -> AppModel {
        AppModel::Waiting(WaitingApp::create(
            Author {
                user_id: "u".to_string(),
                github_id: "g".to_string(),
                name: "n".to_string(),
                photo_url: None,
            },
            0,
            0,
            "desc",
            0,
        ))
    }

    #[test]
    fn test_nothing_is_delivered_before_dispatch() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let pending = bus.create(AppEventKind::MainBranchPushed, &app());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        pending.dispatch_after_commit();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, AppEventKind::MainBranchPushed);
    }

    #[test]
    fn test_dropping_pending_discards_the_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        drop(bus.create(AppEventKind::GitHubCreated, &app()));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_dispatch_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.create(AppEventKind::GitHubCreated, &app())
            .dispatch_after_commit();
    }
}
