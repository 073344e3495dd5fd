//! Application domain model.
//!
//! An application moves through a one-directional lifecycle,
//! `waiting → init → running`, carrying an append-mostly event log
//! ("bubbles") that users watch grow while the factory works.
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `AppModel` sum type + pure stage transitions                |
//! | `bubbles` | `Bubble` event-log entries + upsert-by-external-id merge    |
//!
//! Everything in here is pure data and pure functions; persistence lives in
//! [`crate::store`] and side effects in [`crate::orchestrator`].

pub mod bubbles;
pub mod models;

pub use bubbles::{Bubble, DeploymentRecord, SystemStatus, WorkflowRunRecord, now_millis};
pub use models::{
    AppCore, AppId, AppModel, AppUrls, Author, InitApp, OgpImage, RailwayDeployment, RunningApp,
    WaitingApp, index_to_display_id, index_to_urls,
};
