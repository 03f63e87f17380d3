//! Revision oracles resolve branch names to their current revision and to a
//! working tree holding the branch's files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::Error;

mod git;

pub use git::GitOracle;

#[async_trait]
pub trait RevisionOracle: Send + Sync {
    /// Ensures every named branch has a local working tree reflecting its
    /// latest fetched state.
    async fn ensure_checkouts(&self, branches: &[String]) -> Result<(), Error>;

    /// Returns the tip revision of the branch's local working tree.
    async fn current_revision(&self, branch: &str) -> Result<String, Error>;

    /// Updates all working trees and returns the branches whose tip moved.
    /// A branch failing to update is logged and skipped, it does not keep
    /// the others from being refreshed.
    async fn refresh(&self, branches: &[String]) -> Vec<String>;

    /// Location of the branch's working tree.
    fn working_tree(&self, branch: &str) -> PathBuf;
}

/// A [RevisionOracle] over plain directories `<root>/<branch>`, whose
/// revisions are assigned by the owner with [StaticOracle::set_revision].
///
/// [RevisionOracle::refresh] reports the branches whose revision was changed
/// since the previous refresh (or checkout).
pub struct StaticOracle {
    root: PathBuf,
    revisions: RwLock<HashMap<String, String>>,
    observed: RwLock<HashMap<String, String>>,
}

impl StaticOracle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            revisions: Default::default(),
            observed: Default::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves the branch to `revision`. The first revision set for a branch
    /// counts as already observed.
    pub fn set_revision(&self, branch: &str, revision: &str) {
        self.observed
            .write()
            .entry(branch.to_string())
            .or_insert_with(|| revision.to_string());
        self.revisions
            .write()
            .insert(branch.to_string(), revision.to_string());
    }
}

#[async_trait]
impl RevisionOracle for StaticOracle {
    async fn ensure_checkouts(&self, branches: &[String]) -> Result<(), Error> {
        for branch in branches {
            let revision = self.current_revision(branch).await?;
            let tree = self.working_tree(branch);
            if !tokio::fs::try_exists(&tree)
                .await
                .map_err(Error::io_at(&tree))?
            {
                return Err(Error::UnknownBranch(branch.clone()));
            }
            self.observed.write().insert(branch.clone(), revision);
        }
        Ok(())
    }

    async fn current_revision(&self, branch: &str) -> Result<String, Error> {
        self.revisions
            .read()
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::UnknownBranch(branch.to_string()))
    }

    #[instrument(skip_all)]
    async fn refresh(&self, branches: &[String]) -> Vec<String> {
        let revisions = self.revisions.read();
        let mut observed = self.observed.write();

        let mut changed = Vec::new();
        for branch in branches {
            let Some(revision) = revisions.get(branch) else {
                debug!(branch = %branch, "no revision known, skipping");
                continue;
            };
            if observed.insert(branch.clone(), revision.clone()).as_ref() != Some(revision) {
                changed.push(branch.clone());
            }
        }
        changed
    }

    fn working_tree(&self, branch: &str) -> PathBuf {
        self.root.join(branch)
    }
}
