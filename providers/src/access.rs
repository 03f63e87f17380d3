use std::path::Path;

use tracing::debug;

use crate::directives::{Directory, Error, Protection};

impl Protection {
    /// Exact comparison of both fields. Credentials are stored in plain text.
    pub fn validate(&self, user: &str, password: &str) -> bool {
        self.user == user && self.password == password
    }
}

/// Returns the protection of the deepest folder along `segments` which
/// carries one. The walk stops at the first segment without a folder.
pub fn find_protection<'a, S: AsRef<str>>(
    tree: Option<&'a Directory>,
    segments: &[S],
) -> Option<&'a Protection> {
    let mut current = tree?;
    let mut candidate = current.protection();
    for segment in segments {
        let Some(folder) = current.folder(segment.as_ref()) else {
            break;
        };
        current = folder;
        if let Some(protection) = current.protection() {
            candidate = Some(protection);
        }
    }
    candidate
}

/// Loads a serialized directory tree. A missing file means no folder is
/// protected.
pub async fn load_directory_tree(path: &Path) -> Result<Option<Directory>, Error> {
    match tokio::fs::read(path).await {
        Ok(data) => Directory::from_slice(path, &data).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = ?path, "no directory tree");
            Ok(None)
        }
        Err(e) => Err(Error::Io(path.to_path_buf(), e)),
    }
}
