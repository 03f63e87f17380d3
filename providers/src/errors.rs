use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::{directives, profiles, signing, template};

/// Errors produced while checking out, materializing or publishing profiles.
#[derive(Debug, Error)]
pub enum Error {
    #[error("profile {0:?} not found")]
    ProfileNotFound(String),

    #[error("invalid profiles: {0}")]
    Profiles(#[from] profiles::Error),

    #[error("unknown branch {0:?}")]
    UnknownBranch(String),

    #[error("git {args} failed in {dir:?}: {stderr}")]
    Git {
        args: String,
        dir: PathBuf,
        stderr: String,
    },

    #[error("git {args} in {dir:?} timed out after {timeout:?}")]
    GitTimeout {
        args: String,
        dir: PathBuf,
        timeout: Duration,
    },

    #[error("rendering template {0:?} failed: {1}")]
    Template(PathBuf, #[source] template::Error),

    #[error(transparent)]
    Directives(#[from] directives::Error),

    #[error(transparent)]
    Signing(#[from] signing::Error),

    #[error("applying pattern {pattern:?} to {path:?} failed: {source}")]
    Action {
        pattern: String,
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("i/o error at {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("unable to walk {0:?}: {1}")]
    Walk(PathBuf, #[source] walkdir::Error),

    #[error("publication task failed: {0}")]
    Task(#[from] JoinError),

    #[error("publication actor is gone")]
    ActorGone,

    #[error("the refresh interval must not be zero")]
    ZeroUpdateInterval,
}

impl Error {
    /// Returns a closure wrapping an [std::io::Error] with the path it occured at,
    /// to be used with [Result::map_err].
    pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |e| Error::Io(path, e)
    }
}
