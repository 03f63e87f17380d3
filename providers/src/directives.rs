//! Directive files found while merging, and the directory tree collecting
//! them, which is served alongside a materialized profile.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the directive files in the source trees. They are never copied.
pub const DIRECTIVES_FILE: &str = ".directives.toml";

/// Name of the serialized [Directory] tree in the root of a materialized
/// profile.
pub const DIRECTORIES_FILE: &str = ".directories.json";

/// Name of the file recording the settings a materialized profile was built
/// with.
pub const STAMP_FILE: &str = ".publication.json";

/// Bookkeeping files of a materialized profile. They are never
/// post-processed nor served.
pub const PRIVATE_FILES: [&str; 2] = [DIRECTORIES_FILE, STAMP_FILE];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("directives at {path:?} are not valid UTF-8")]
    Utf8 { path: String },

    #[error("parsing directives at {path:?} failed: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("unable to encode directory tree: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to decode directory tree {0:?}: {1}")]
    Decode(PathBuf, #[source] serde_json::Error),

    #[error("i/o error at {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Credentials protecting a folder and everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    pub user: String,
    pub password: String,
}

/// Contents of a [DIRECTIVES_FILE].
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Directives {
    pub protection: Option<Protection>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection: Option<Protection>,
}

/// A folder of the directory tree. The root has an empty name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    /// Sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<Directory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

impl Directory {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn folder(&self, name: &str) -> Option<&Directory> {
        self.folders
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.folders[idx])
    }

    fn folder_mut(&mut self, name: &str) -> &mut Directory {
        let idx = match self.folders.binary_search_by(|f| f.name.as_str().cmp(name)) {
            Ok(idx) => idx,
            Err(idx) => {
                self.folders.insert(idx, Directory::named(name));
                idx
            }
        };
        &mut self.folders[idx]
    }

    pub fn protection(&self) -> Option<&Protection> {
        self.attributes.as_ref()?.protection.as_ref()
    }

    pub fn from_slice(path: &Path, data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(path.to_path_buf(), e))
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), Error> {
        let mut data = serde_json::to_vec(self).map_err(Error::Encode)?;
        data.push(b'\n');
        std::fs::write(path, data).map_err(|e| Error::Io(path.to_path_buf(), e))
    }
}

/// Collects directives into a [Directory] tree.
#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    root: Option<Directory>,
}

impl DirectoryBuilder {
    /// Attaches the directives parsed from `data` to the folder at
    /// `segments`, creating intermediate folders. Directives added later for
    /// the same folder replace earlier ones.
    pub fn add_directives(&mut self, segments: &[String], data: &[u8]) -> Result<(), Error> {
        let path = segments.join("/");
        let text = std::str::from_utf8(data).map_err(|_| Error::Utf8 { path: path.clone() })?;
        let directives: Directives =
            toml::from_str(text).map_err(|source| Error::Parse { path, source })?;

        let mut current = self.root.get_or_insert_with(Directory::default);
        for segment in segments {
            current = current.folder_mut(segment);
        }
        current.attributes = Some(Attributes {
            protection: directives.protection,
        });
        Ok(())
    }

    /// The collected tree, `None` if no directives were added.
    pub fn into_tree(self) -> Option<Directory> {
        self.root
    }
}
