//! Source-repository adapter: local clones of the generated repositories.
//!
//! All git operations shell out to the `git` CLI via `tokio::process`, one
//! clone per application under the configured workdir.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::app::AppModel;
use crate::config::Config;
use crate::llm::SourceDiff;

/// One text file in a generated repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    pub content: String,
}

/// Snapshot of a repository's working tree.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    pub files: Vec<RepoFile>,
    /// Paths deleted over the repo's history; the fixer may restore them.
    pub deleted_files: Vec<String>,
}

/// What the orchestrator needs from the generated source repository.
#[async_trait]
pub trait SourceRepo: Send + Sync {
    async fn get_files(&self, app: &AppModel) -> Result<RepoSnapshot>;
    async fn push_diff(&self, app: &AppModel, diff: &SourceDiff) -> Result<()>;
}

pub struct LocalGitRepo {
    workdir: PathBuf,
    token: String,
    owner: String,
}

impl LocalGitRepo {
    pub fn new(config: &Config) -> Self {
        Self {
            workdir: config.workdir.clone(),
            token: config.github_token.clone(),
            owner: config.github_owner.clone(),
        }
    }

    fn clone_dir(&self, app: &AppModel) -> PathBuf {
        self.workdir.join(app.display_id())
    }

    fn remote_url(&self, app: &AppModel) -> String {
        format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            self.token,
            self.owner,
            app.display_id()
        )
    }

    /// Clone the repo if absent, otherwise hard-reset to the remote main.
    async fn ensure_fresh_clone(&self, app: &AppModel) -> Result<PathBuf> {
        let dir = self.clone_dir(app);
        if dir.join(".git").exists() {
            run_git(&dir, &["fetch", "origin", "main"]).await?;
            run_git(&dir, &["reset", "--hard", "origin/main"]).await?;
        } else {
            tokio::fs::create_dir_all(&self.workdir)
                .await
                .context("failed to create workdir")?;
            let url = self.remote_url(app);
            run_git(
                &self.workdir,
                &["clone", &url, &app.display_id().to_string()],
            )
            .await?;
        }
        Ok(dir)
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

async fn git_stdout(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    String::from_utf8(output.stdout).context("invalid UTF-8 in git output")
}

/// Directories that never carry hand-written or generated source we care about.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "dist", ".next"];

fn collect_files(root: &Path) -> Result<Vec<RepoFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIPPED_DIRS.contains(&name))
                .unwrap_or(true)
        })
    {
        let entry = entry.context("failed to walk repository")?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Binary files fail UTF-8 decoding and are skipped.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let path = entry
            .path()
            .strip_prefix(root)
            .context("walked file outside root")?
            .to_string_lossy()
            .replace('\\', "/");
        files.push(RepoFile { path, content });
    }
    Ok(files)
}

#[async_trait]
impl SourceRepo for LocalGitRepo {
    async fn get_files(&self, app: &AppModel) -> Result<RepoSnapshot> {
        let dir = self.ensure_fresh_clone(app).await?;

        let deleted_raw = git_stdout(
            &dir,
            &["log", "--diff-filter=D", "--name-only", "--pretty=format:"],
        )
        .await?;
        let mut deleted_files: Vec<String> = deleted_raw
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        deleted_files.sort();
        deleted_files.dedup();

        let files = collect_files(&dir)?;
        Ok(RepoSnapshot {
            files,
            deleted_files,
        })
    }

    async fn push_diff(&self, app: &AppModel, diff: &SourceDiff) -> Result<()> {
        let dir = self.ensure_fresh_clone(app).await?;

        for file in &diff.files {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("failed to create file parent directory")?;
            }
            tokio::fs::write(&target, &file.content)
                .await
                .with_context(|| format!("failed to write {}", file.path))?;
        }
        for path in &diff.deleted_files {
            let target = dir.join(path);
            if target.exists() {
                tokio::fs::remove_file(&target)
                    .await
                    .with_context(|| format!("failed to delete {}", path))?;
            }
        }

        run_git(&dir, &["add", "-A"]).await?;
        run_git(&dir, &["commit", "-m", &diff.message]).await?;
        run_git(&dir, &["push", "origin", "main"]).await?;

        tracing::info!(
            display_id = app.display_id(),
            message = diff.message,
            "pushed fix to generated repository"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_files_skips_vendored_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(dir.path().join("server")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(dir.path().join("server/index.ts"), "export {}").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8, 159, 146, 150]).unwrap();

        let files = collect_files(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["server/index.ts"]);
    }

    #[test]
    fn test_collect_files_paths_are_repo_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), "hi").unwrap();

        let files = collect_files(dir.path()).unwrap();
        assert_eq!(files[0].path, "a/b/c.txt");
        assert_eq!(files[0].content, "hi");
    }
}
