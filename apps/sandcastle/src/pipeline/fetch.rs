use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sandcastle_recipe::{Recipe, ResolveError};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Materialises a repository into a local directory.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, repo_url: &str, dest: &Path, timeout: Duration) -> Result<(), FetchError>;
}

/// Shallow `git clone`; the child is killed if the clone overruns its budget.
#[derive(Debug, Default, Clone)]
pub struct GitFetcher;

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, repo_url: &str, dest: &Path, timeout: Duration) -> Result<(), FetchError> {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--", repo_url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(repo_url = %repo_url, dest = %dest.display(), "git clone");
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| FetchError(format!("git clone timed out after {}s", timeout.as_secs())))?
            .map_err(|err| FetchError(format!("git clone could not start: {err}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(FetchError(format!("git clone failed: {}", stderr.trim())))
        }
    }
}

/// Repository tree to build recipe. Synchronous; callers run it off the async workers.
pub trait RecipeResolver: Send + Sync {
    fn resolve(&self, repo_root: &Path) -> Result<Recipe, ResolveError>;
}

#[derive(Debug, Default, Clone)]
pub struct DefaultResolver;

impl RecipeResolver for DefaultResolver {
    fn resolve(&self, repo_root: &Path) -> Result<Recipe, ResolveError> {
        sandcastle_recipe::resolve(repo_root)
    }
}
