use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::{Error, RevisionOracle};

/// Content identity of a resolved profile: the SHA-256 digest over the
/// ordered (branch, revision) pairs of its branches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Folds the pairs in the given order. Both fields are terminated by a
    /// NUL byte, so no two distinct sequences share an encoding.
    pub fn from_revisions<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut hasher = Sha256::new();
        for (branch, revision) in pairs {
            hasher.update(branch.as_bytes());
            hasher.update([0]);
            hasher.update(revision.as_bytes());
            hasher.update([0]);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Resolves the current revision of every branch, in order, and computes
/// their [Fingerprint].
#[instrument(skip(oracle), err)]
pub async fn fingerprint(
    oracle: &dyn RevisionOracle,
    branches: &[String],
) -> Result<Fingerprint, Error> {
    let mut revisions = Vec::with_capacity(branches.len());
    for branch in branches {
        revisions.push(oracle.current_revision(branch).await?);
    }

    Ok(Fingerprint::from_revisions(
        branches
            .iter()
            .map(String::as_str)
            .zip(revisions.iter().map(String::as_str)),
    ))
}
