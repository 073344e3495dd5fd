//! Atelier — AI web-app factory backend.
//!
//! A user describes a web application in natural language; an agent pipeline
//! scaffolds it into a generated GitHub repository, deploys it, and keeps
//! repairing failing builds. The heart of the crate is
//! [`orchestrator::Orchestrator`]: the state machine tracking each app from
//! `waiting` through `init` to `running`, reconciling webhooks from GitHub
//! CI, and driving the automatic retry-and-repair loop.

pub mod app;
pub mod config;
pub mod errors;
pub mod events;
pub mod github;
pub mod gitrepo;
pub mod llm;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod tunnel;
