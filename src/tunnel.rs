//! Dev-mode tunnel: exposes the local webhook endpoint to the internet and
//! reports every (re)connect so the orchestrator can replay CI state missed
//! while unreachable.
//!
//! Outside dev mode this module does nothing — production deployments have a
//! stable public webhook URL.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Spawn the tunnel loop when running locally. `on_reconnect` fires on every
/// successful (re)connect, including the first.
pub fn spawn_if_local<F, Fut>(config: &Config, on_reconnect: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if !config.dev_mode {
        return;
    }

    let cmd = config.tunnel_cmd.clone();
    let port = config.port;
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_tunnel(&cmd, port, &on_reconnect).await {
                tracing::warn!(error = %e, "tunnel exited, reconnecting");
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

/// Run one tunnel process to completion. The tunnel counts as connected (and
/// `on_reconnect` fires) when it prints its public URL.
async fn run_tunnel<F, Fut>(cmd: &str, port: u16, on_reconnect: &F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut child = tokio::process::Command::new(cmd)
        .args(["tunnel", "--url", &format!("http://127.0.0.1:{}", port)])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn tunnel command '{}'", cmd))?;

    let stdout = child.stdout.take().context("tunnel has no stdout")?;
    let mut lines = BufReader::new(stdout).lines();
    let mut connected = false;

    while let Some(line) = lines.next_line().await? {
        if !connected && line.contains("https://") {
            connected = true;
            tracing::info!(url = line.trim(), "tunnel connected");
            on_reconnect().await;
        }
    }

    let status = child.wait().await.context("failed to wait for tunnel")?;
    anyhow::bail!("tunnel process exited with {}", status);
}
