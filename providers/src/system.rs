//! The publication actor. It owns the result and web roots, and processes
//! serve and refresh commands one at a time, so materializing a profile and
//! invalidating it never interleave.
//!
//! Published state lives on disk only: a profile is published iff the alias
//! `<web_root>/<profile>` exists, a symlink to `<result_root>/<fingerprint>`.
//! Each materialized directory carries a [STAMP_FILE] with the settings it
//! was rendered and signed with, so directories of an earlier run with
//! other settings are not reused.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::directives::{DirectoryBuilder, DIRECTORIES_FILE, STAMP_FILE};
use crate::fingerprint::fingerprint;
use crate::merge::merge;
use crate::postprocess::{default_pattern_actions, PatternActions};
use crate::profiles::Profiles;
use crate::signing::SigningKey;
use crate::template::{BaseUrl, TemplateParams, UnknownKeys};
use crate::{Error, RevisionOracle};

/// Prefix of the directories materializations are built in.
pub const STAGING_PREFIX: &str = ".staging-";

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Holds one alias per published profile.
    pub web_root: PathBuf,
    /// Holds the materialized directories.
    pub result_root: PathBuf,
    pub base_url: BaseUrl,
    /// Interval between branch refreshes.
    pub update: Duration,
    /// Render unknown template parameters empty instead of failing.
    pub lenient_templates: bool,
}

/// Everything besides the branch revisions that goes into a materialized
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp {
    base_url: String,
    protocol: String,
    host: String,
    port: u16,
    key_fingerprint: String,
    lenient_templates: bool,
}

impl Stamp {
    fn new(cfg: &SystemConfig, key: &SigningKey) -> Self {
        Self {
            base_url: cfg.base_url.template.clone(),
            protocol: cfg.base_url.protocol.clone(),
            host: cfg.base_url.host.clone(),
            port: cfg.base_url.port,
            key_fingerprint: key.fingerprint().to_string(),
            lenient_templates: cfg.lenient_templates,
        }
    }

    /// Whether `dir` was built with this stamp. Unreadable stamps don't match.
    async fn matches(&self, dir: &Path) -> bool {
        match tokio::fs::read(dir.join(STAMP_FILE)).await {
            Ok(data) => serde_json::from_slice::<Stamp>(&data).is_ok_and(|s| &s == self),
            Err(_) => false,
        }
    }

    fn write_to(&self, dir: &Path) -> Result<(), Error> {
        let path = dir.join(STAMP_FILE);
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| Error::Io(path.clone(), e.into()))?;
        std::fs::write(&path, data).map_err(Error::io_at(path))
    }
}

enum Command {
    Serve {
        profile: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Refresh {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Handle to the publication actor, cheap to clone.
#[derive(Clone)]
pub struct System {
    tx: mpsc::Sender<Command>,
    profiles: Arc<Profiles>,
    web_root: PathBuf,
}

impl System {
    /// Creates the roots and returns a handle together with the [Actor],
    /// which needs to be spawned for the handle to make progress.
    pub fn new(
        cfg: SystemConfig,
        profiles: Profiles,
        oracle: Arc<dyn RevisionOracle>,
        key: Arc<SigningKey>,
    ) -> Result<(Self, Actor), Error> {
        // tokio intervals panic on a zero period
        if cfg.update.is_zero() {
            return Err(Error::ZeroUpdateInterval);
        }
        if cfg.base_url.template.contains("{profile}") {
            for group in profiles.shared_recipes() {
                warn!(
                    profiles = ?group,
                    "profiles share one materialized directory, its URLs name only one of them"
                );
            }
        }

        let web_root = absolute_dir(&cfg.web_root)?;
        let result_root = absolute_dir(&cfg.result_root)?;
        let cfg = SystemConfig {
            web_root: web_root.clone(),
            result_root,
            ..cfg
        };

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let profiles = Arc::new(profiles);
        let actor = Actor {
            rx,
            actions: default_pattern_actions(key.clone()),
            stamp: Stamp::new(&cfg, &key),
            cfg,
            profiles: profiles.clone(),
            oracle,
            key,
        };

        Ok((
            Self {
                tx,
                profiles,
                web_root,
            },
            actor,
        ))
    }

    /// Ensures the profile is published, materializing it if needed. Once
    /// this returns successfully, the profile's files can be read below
    /// [System::web_root].
    pub async fn serve(&self, profile: &str) -> Result<(), Error> {
        if !self.profiles.contains(profile) {
            return Err(Error::ProfileNotFound(profile.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Serve {
                profile: profile.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::ActorGone)?;
        rx.await.map_err(|_| Error::ActorGone)?
    }

    /// Refreshes all branches right away, returning the profiles whose
    /// publication was invalidated.
    pub async fn refresh(&self) -> Result<Vec<String>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh { reply })
            .await
            .map_err(|_| Error::ActorGone)?;
        rx.await.map_err(|_| Error::ActorGone)
    }

    /// Stops the actor after the commands queued before.
    pub async fn kill(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    pub fn profiles(&self) -> &Profiles {
        &self.profiles
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }
}

pub struct Actor {
    rx: mpsc::Receiver<Command>,
    cfg: SystemConfig,
    profiles: Arc<Profiles>,
    oracle: Arc<dyn RevisionOracle>,
    key: Arc<SigningKey>,
    actions: PatternActions,
    stamp: Stamp,
}

impl Actor {
    /// Sweeps leftovers of earlier runs, then processes commands and
    /// refreshes periodically until cancelled or shut down.
    pub async fn run(mut self, token: CancellationToken) {
        if let Err(e) = self.collect_garbage().await {
            warn!(err = %e, "sweeping stale publications failed");
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.cfg.update, self.cfg.update);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("publication actor cancelled");
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(Command::Serve { profile, reply }) => {
                        let _ = reply.send(self.serve(&profile).await);
                    }
                    Some(Command::Refresh { reply }) => {
                        let _ = reply.send(self.refresh().await);
                    }
                    Some(Command::Shutdown) | None => {
                        info!("publication actor stopped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }

    fn alias(&self, profile: &str) -> PathBuf {
        self.cfg.web_root.join(profile)
    }

    #[instrument(skip(self), err)]
    async fn serve(&mut self, profile: &str) -> Result<(), Error> {
        let branches = self
            .profiles
            .branches(profile)
            .ok_or_else(|| Error::ProfileNotFound(profile.to_string()))?;

        let alias = self.alias(profile);
        match tokio::fs::symlink_metadata(&alias).await {
            Ok(_) => {
                if tokio::fs::metadata(&alias).await.is_ok() {
                    debug!("already published");
                    return Ok(());
                }
                warn!(alias = ?alias, "removing dangling alias");
                tokio::fs::remove_file(&alias)
                    .await
                    .map_err(Error::io_at(&alias))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(alias, e)),
        }

        let fp = fingerprint(self.oracle.as_ref(), &branches).await?;
        let target = self.cfg.result_root.join(fp.to_hex());

        let exists = tokio::fs::try_exists(&target)
            .await
            .map_err(Error::io_at(&target))?;
        if exists && self.stamp.matches(&target).await {
            debug!(fingerprint = %fp, "reusing materialized directory");
        } else {
            if exists {
                warn!(fingerprint = %fp, "replacing directory built with other settings");
                remove_dir_if_exists(&target).await?;
            }
            self.materialize(profile, &branches, &target).await?;
        }

        tokio::fs::symlink(&target, &alias)
            .await
            .map_err(Error::io_at(&alias))?;
        info!(fingerprint = %fp, "published");
        Ok(())
    }

    #[instrument(skip(self, branches), err)]
    async fn materialize(
        &self,
        profile: &str,
        branches: &[String],
        target: &Path,
    ) -> Result<(), Error> {
        let trees: Vec<PathBuf> = branches
            .iter()
            .map(|b| self.oracle.working_tree(b))
            .collect();
        let params = TemplateParams::new(
            &self.cfg.base_url.expand(profile),
            self.key.key_id(),
            self.key.fingerprint(),
        );
        let unknown = if self.cfg.lenient_templates {
            UnknownKeys::Lenient
        } else {
            UnknownKeys::Strict
        };

        let result_root = self.cfg.result_root.clone();
        let target = target.to_path_buf();
        let actions = self.actions.clone();
        let key = self.key.clone();
        let stamp = self.stamp.clone();

        tokio::task::spawn_blocking(move || {
            build_tree(
                &result_root,
                &target,
                &trees,
                &params,
                unknown,
                &actions,
                &key,
                &stamp,
            )
        })
        .await?
    }

    /// Refreshes all branches and invalidates the profiles depending on the
    /// ones which moved.
    #[instrument(skip(self))]
    async fn refresh(&mut self) -> Vec<String> {
        let changed = self.oracle.refresh(&self.profiles.all_branches()).await;
        if changed.is_empty() {
            debug!("no branch moved");
            return Vec::new();
        }
        info!(changed = ?changed, "branches moved");

        let dependents: Vec<String> = self
            .profiles
            .dependents(&changed)
            .map(String::from)
            .collect();

        let mut invalidated = Vec::new();
        for profile in dependents {
            match self.invalidate(&profile).await {
                Ok(true) => invalidated.push(profile),
                Ok(false) => {}
                Err(e) => warn!(profile = %profile, err = %e, "invalidation failed"),
            }
        }
        invalidated
    }

    /// Removes the profile's alias and the directory it points to. Returns
    /// false if the profile was not published.
    #[instrument(skip(self), err)]
    async fn invalidate(&self, profile: &str) -> Result<bool, Error> {
        let alias = self.alias(profile);
        let target = match tokio::fs::read_link(&alias).await {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(alias, e)),
        };

        tokio::fs::remove_file(&alias)
            .await
            .map_err(Error::io_at(&alias))?;
        remove_dir_if_exists(&target).await?;
        info!(target = ?target, "invalidated");
        Ok(true)
    }

    /// Removes staging directories, aliases of profiles no longer configured
    /// or no longer matching their fingerprint or stamp, and materialized
    /// directories no alias points to.
    #[instrument(skip(self), err)]
    async fn collect_garbage(&self) -> Result<(), Error> {
        let mut live = HashSet::new();

        let web_root = &self.cfg.web_root;
        let mut entries = tokio::fs::read_dir(web_root)
            .await
            .map_err(Error::io_at(web_root))?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::io_at(web_root))? {
            let alias = entry.path();
            let Ok(target) = tokio::fs::read_link(&alias).await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();

            let current = match self.profiles.branches(&name) {
                Some(branches) => match fingerprint(self.oracle.as_ref(), &branches).await {
                    Ok(fp) => Some(fp.to_hex()),
                    Err(e) => {
                        warn!(profile = %name, err = %e, "unable to fingerprint");
                        None
                    }
                },
                None => None,
            };
            let target_name = target.file_name().map(|n| n.to_string_lossy().into_owned());

            if current.is_some()
                && current == target_name
                && target.is_dir()
                && self.stamp.matches(&target).await
            {
                live.extend(target_name);
                continue;
            }
            info!(alias = ?alias, "removing stale alias");
            tokio::fs::remove_file(&alias)
                .await
                .map_err(Error::io_at(&alias))?;
        }

        let result_root = &self.cfg.result_root;
        let mut entries = tokio::fs::read_dir(result_root)
            .await
            .map_err(Error::io_at(result_root))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(Error::io_at(result_root))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || (is_fingerprint(&name) && !live.contains(&name))
            {
                info!(path = ?entry.path(), "removing unreferenced directory");
                remove_dir_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }
}

/// Builds the materialized directory in a staging directory next to
/// `target`, which is only renamed into place once complete. The staging
/// directory is removed on failure.
#[allow(clippy::too_many_arguments)]
fn build_tree(
    result_root: &Path,
    target: &Path,
    trees: &[PathBuf],
    params: &TemplateParams,
    unknown: UnknownKeys,
    actions: &PatternActions,
    key: &SigningKey,
    stamp: &Stamp,
) -> Result<(), Error> {
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(result_root)
        .map_err(Error::io_at(result_root))?;
    let dir = staging.path();

    let mut directories = DirectoryBuilder::default();
    merge(dir, trees, params, unknown, |segments, data| {
        Ok(directories.add_directives(segments, data)?)
    })?;
    actions.apply(dir)?;
    key.write_public_key(dir).map_err(Error::io_at(dir))?;
    if let Some(tree) = directories.into_tree() {
        tree.write_to_file(&dir.join(DIRECTORIES_FILE))?;
    }
    stamp.write_to(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
        .map_err(Error::io_at(dir))?;

    let staged = staging.keep();
    if let Err(e) = std::fs::rename(&staged, target) {
        let _ = std::fs::remove_dir_all(&staged);
        return Err(Error::Io(target.to_path_buf(), e));
    }
    Ok(())
}

fn absolute_dir(path: &Path) -> Result<PathBuf, Error> {
    std::fs::create_dir_all(path).map_err(Error::io_at(path))?;
    std::fs::canonicalize(path).map_err(Error::io_at(path))
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(path.to_path_buf(), e)),
    }
}

fn is_fingerprint(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
