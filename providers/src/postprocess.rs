//! Per-file actions applied to a merged tree: checksum sidecars and
//! detached signatures. Every action skips sidecars which already exist, so
//! applying the same [PatternActions] twice leaves the tree untouched.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use data_encoding::HEXLOWER;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::digest::DynDigest;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::directives::PRIVATE_FILES;
use crate::signing::{SigningKey, SIGNATURE_EXTENSION};
use crate::Error;

lazy_static! {
    static ref PROVIDER_METADATA: Regex = Regex::new(r"^provider-metadata\.json$").unwrap();
    static ref SERVICE_DOCUMENT: Regex = Regex::new(r"^service\.json$").unwrap();
    static ref FEED: Regex = Regex::new(r"^feed-tlp-[a-z]+\.json$").unwrap();
    static ref CATEGORY: Regex = Regex::new(r"^category-[a-z]+\.json$").unwrap();
    static ref JSON: Regex = Regex::new(r"\.json$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn extension(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Writes `<file>.<algorithm>` containing `<hex digest> <basename>\n`.
    Hash(Vec<HashAlgorithm>),
    /// Writes an armored detached signature to `<file>.asc`.
    Sign(Arc<SigningKey>),
}

impl Action {
    fn apply(&self, path: &Path) -> Result<(), Error> {
        match self {
            Action::Hash(algorithms) => hash_file(path, algorithms),
            Action::Sign(key) => sign_file(path, key),
        }
    }
}

/// Actions applied to every file whose name matches `pattern`. An empty
/// action list excludes the matching files from all later patterns.
#[derive(Debug, Clone)]
pub struct PatternAction {
    pub pattern: Regex,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default)]
pub struct PatternActions(pub Vec<PatternAction>);

impl PatternActions {
    /// Applies the actions of the first matching pattern to every regular
    /// file below `dir`. The file list is taken before the first action runs,
    /// so generated sidecars are never processed themselves.
    #[instrument(skip(self), err)]
    pub fn apply(&self, dir: &Path) -> Result<(), Error> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Walk(dir.to_path_buf(), e))?;
            let private = entry
                .file_name()
                .to_str()
                .is_some_and(|name| PRIVATE_FILES.contains(&name));
            if entry.file_type().is_file() && !private {
                files.push(entry.into_path());
            }
        }

        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                debug!(path = ?path, "skipping non UTF-8 file name");
                continue;
            };
            let Some(matched) = self.0.iter().find(|pa| pa.pattern.is_match(name)) else {
                continue;
            };
            for action in &matched.actions {
                action.apply(&path).map_err(|e| Error::Action {
                    pattern: matched.pattern.to_string(),
                    path: path.clone(),
                    source: Box::new(e),
                })?;
            }
        }
        Ok(())
    }
}

/// Hashes and signs every JSON document, except the generated metadata
/// documents which change with every feed update.
pub fn default_pattern_actions(key: Arc<SigningKey>) -> PatternActions {
    let excluded = |pattern: &Regex| PatternAction {
        pattern: pattern.clone(),
        actions: vec![],
    };
    PatternActions(vec![
        excluded(&*PROVIDER_METADATA),
        excluded(&*SERVICE_DOCUMENT),
        excluded(&*FEED),
        excluded(&*CATEGORY),
        PatternAction {
            pattern: JSON.clone(),
            actions: vec![
                Action::Hash(vec![HashAlgorithm::Sha256, HashAlgorithm::Sha512]),
                Action::Sign(key),
            ],
        },
    ])
}

fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn exists(path: &Path) -> Result<bool, Error> {
    path.try_exists().map_err(Error::io_at(path))
}

fn hash_file(path: &Path, algorithms: &[HashAlgorithm]) -> Result<(), Error> {
    let mut pending = Vec::new();
    for algorithm in algorithms {
        let target = sidecar(path, algorithm.extension());
        if !exists(&target)? {
            pending.push((target, algorithm.hasher()));
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let mut file = std::fs::File::open(path).map_err(Error::io_at(path))?;
    let mut buf = vec![0; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(Error::io_at(path))?;
        if n == 0 {
            break;
        }
        for (_, hasher) in pending.iter_mut() {
            hasher.update(&buf[..n]);
        }
    }

    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for (target, hasher) in pending {
        let line = format!("{} {basename}\n", HEXLOWER.encode(&hasher.finalize()));
        std::fs::write(&target, line).map_err(Error::io_at(&target))?;
    }
    Ok(())
}

fn sign_file(path: &Path, key: &SigningKey) -> Result<(), Error> {
    let target = sidecar(path, SIGNATURE_EXTENSION);
    if exists(&target)? {
        return Ok(());
    }
    let data = std::fs::read(path).map_err(Error::io_at(path))?;
    std::fs::write(&target, key.sign_armored(&data)?).map_err(Error::io_at(&target))
}
