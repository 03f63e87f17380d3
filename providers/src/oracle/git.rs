use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::RevisionOracle;
use crate::Error;

/// A [RevisionOracle] backed by the `git` binary.
///
/// The repository is cloned once into `<workdir>/<default_branch>`, every
/// other branch gets its own worktree `<workdir>/<branch>` next to it.
/// Every git invocation is bounded by `timeout`, the process is killed when
/// the timeout elapses.
pub struct GitOracle {
    url: String,
    workdir: PathBuf,
    default_branch: String,
    timeout: Duration,
}

impl GitOracle {
    pub fn new(
        url: impl Into<String>,
        workdir: impl AsRef<Path>,
        default_branch: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let workdir = workdir.as_ref();
        let workdir = if workdir.is_absolute() {
            workdir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(Error::io_at(workdir))?
                .join(workdir)
        };
        Ok(Self {
            url: url.into(),
            workdir,
            default_branch: default_branch.into(),
            timeout,
        })
    }

    fn clone_dir(&self) -> PathBuf {
        self.workdir.join(&self.default_branch)
    }

    /// Runs git with the given arguments in `dir`, returning its stdout.
    #[instrument(level = "debug", skip(self), err)]
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, Error> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.map_err(Error::io_at(dir))?,
            Err(_) => {
                return Err(Error::GitTimeout {
                    args: args.join(" "),
                    dir: dir.to_path_buf(),
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(Error::Git {
                args: args.join(" "),
                dir: dir.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn pull(&self, dir: &Path) -> Result<(), Error> {
        self.git(dir, &["pull", "--ff-only", "--quiet"]).await?;
        Ok(())
    }
}

#[async_trait]
impl RevisionOracle for GitOracle {
    #[instrument(skip(self), fields(url = %self.url, workdir = ?self.workdir), err)]
    async fn ensure_checkouts(&self, branches: &[String]) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .map_err(Error::io_at(&self.workdir))?;

        let clone_dir = self.clone_dir();
        if tokio::fs::try_exists(&clone_dir)
            .await
            .map_err(Error::io_at(&clone_dir))?
        {
            debug!(dir = ?clone_dir, "updating clone");
            self.pull(&clone_dir).await?;
        } else {
            info!(dir = ?clone_dir, "cloning repository");
            let target = clone_dir.to_string_lossy();
            self.git(
                &self.workdir,
                &[
                    "clone",
                    "--quiet",
                    "--branch",
                    &self.default_branch,
                    &self.url,
                    &target,
                ],
            )
            .await?;
        }

        for branch in branches.iter().filter(|b| **b != self.default_branch) {
            let tree = self.working_tree(branch);
            if tokio::fs::try_exists(&tree)
                .await
                .map_err(Error::io_at(&tree))?
            {
                debug!(branch = %branch, "updating worktree");
                self.pull(&tree).await?;
            } else {
                info!(branch = %branch, "adding worktree");
                let target = tree.to_string_lossy();
                self.git(&clone_dir, &["worktree", "add", "--quiet", &target, branch])
                    .await?;
            }
        }

        Ok(())
    }

    async fn current_revision(&self, branch: &str) -> Result<String, Error> {
        let revision = self
            .git(&self.working_tree(branch), &["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();
        debug!(branch = %branch, revision = %revision, "current revision");
        Ok(revision)
    }

    #[instrument(skip_all)]
    async fn refresh(&self, branches: &[String]) -> Vec<String> {
        let mut changed = Vec::new();
        for branch in branches {
            let tree = self.working_tree(branch);
            let result = async {
                let before = self.current_revision(branch).await?;
                self.pull(&tree).await?;
                let after = self.current_revision(branch).await?;
                Ok::<_, Error>(before != after)
            }
            .await;

            match result {
                Ok(true) => changed.push(branch.clone()),
                Ok(false) => {}
                Err(e) => warn!(branch = %branch, err = %e, "refreshing branch failed"),
            }
        }
        changed
    }

    fn working_tree(&self, branch: &str) -> PathBuf {
        if branch == self.default_branch {
            self.clone_dir()
        } else {
            self.workdir.join(branch)
        }
    }
}
