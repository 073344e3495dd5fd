//! Runtime configuration, collected once at startup from CLI flags and
//! environment variables (`.env` is loaded by the binary before this runs).

use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    /// Local development: permissive CORS and a tunnel instead of a public
    /// webhook endpoint.
    pub dev_mode: bool,

    pub github_token: String,
    pub github_owner: String,
    /// Public URL GitHub delivers webhooks to.
    pub webhook_url: String,

    pub openai_api_key: String,
    pub openai_model: String,

    /// Root directory for local clones of generated repositories.
    pub workdir: PathBuf,
    /// Command used to open a dev tunnel (e.g. `cloudflared`).
    pub tunnel_cmd: String,
}

impl Config {
    pub fn from_env(port: u16, db_path: PathBuf, dev_mode: bool) -> Result<Self> {
        let github_owner = std::env::var("GITHUB_OWNER")
            .unwrap_or_else(|_| crate::app::models::GITHUB_OWNER.to_string());
        Ok(Self {
            port,
            db_path,
            dev_mode,
            github_token: std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN is not set")?,
            github_owner,
            webhook_url: std::env::var("WEBHOOK_URL")
                .unwrap_or_else(|_| format!("http://127.0.0.1:{}/api/webhooks/github", port)),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is not set")?,
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            workdir: std::env::var("ATELIER_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".atelier/repos")),
            tunnel_cmd: std::env::var("TUNNEL_CMD").unwrap_or_else(|_| "cloudflared".to_string()),
        })
    }
}
