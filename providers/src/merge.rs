use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::directives::DIRECTIVES_FILE;
use crate::template::{Template, TemplateParams, UnknownKeys};
use crate::Error;

/// Subtree of every working tree holding the files to publish.
pub const PUBLISHED_SUBTREE: [&str; 2] = ["www", "html"];

/// Merges the published subtrees of `trees` into `destination`, in order,
/// rendering every file as a template. Files of later trees overwrite files
/// of earlier ones at the same path. Directive files are handed to
/// `on_directive` with the segments of the folder they were found in,
/// instead of being copied.
#[instrument(skip(params, on_directive), err)]
pub fn merge<F>(
    destination: &Path,
    trees: &[PathBuf],
    params: &TemplateParams,
    unknown: UnknownKeys,
    mut on_directive: F,
) -> Result<(), Error>
where
    F: FnMut(&[String], &[u8]) -> Result<(), Error>,
{
    std::fs::create_dir_all(destination).map_err(Error::io_at(destination))?;

    for tree in trees {
        let source: PathBuf = PUBLISHED_SUBTREE.iter().fold(tree.clone(), |p, s| p.join(s));
        if !source.is_dir() {
            warn!(tree = ?tree, "no published subtree, skipping");
            continue;
        }

        let walker = WalkDir::new(&source)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        for entry in walker {
            let entry = entry.map_err(|e| Error::Walk(source.clone(), e))?;
            let Ok(relative) = entry.path().strip_prefix(&source) else {
                continue;
            };
            let target = destination.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                std::fs::create_dir_all(&target).map_err(Error::io_at(&target))?;
                copy_permissions(entry.path(), &target)?;
            } else if file_type.is_file() {
                let data = std::fs::read(entry.path()).map_err(Error::io_at(entry.path()))?;

                if entry.file_name() == DIRECTIVES_FILE {
                    let segments: Vec<String> = relative
                        .parent()
                        .into_iter()
                        .flat_map(|p| p.iter())
                        .map(|s| s.to_string_lossy().into_owned())
                        .collect();
                    debug!(path = ?relative, "found directives");
                    on_directive(&segments, &data)?;
                    continue;
                }

                let rendered = Template::parse(&data)
                    .and_then(|t| t.render(params, unknown))
                    .map_err(|e| Error::Template(entry.path().to_path_buf(), e))?;
                write_file(&target, &rendered)?;
                copy_permissions(entry.path(), &target)?;
            } else {
                debug!(path = ?entry.path(), "skipping non-regular file");
            }
        }
    }
    Ok(())
}

/// Replaces any previous file at `target`, it may not be writable.
fn write_file(target: &Path, data: &[u8]) -> Result<(), Error> {
    match std::fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(target.to_path_buf(), e)),
    }
    std::fs::write(target, data).map_err(Error::io_at(target))
}

fn copy_permissions(source: &Path, target: &Path) -> Result<(), Error> {
    let mode = std::fs::metadata(source)
        .map_err(Error::io_at(source))?
        .permissions()
        .mode();
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(Error::io_at(target))
}
