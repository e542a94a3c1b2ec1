//! Path normalization utilities for moving between remote namespace paths
//! (always POSIX-style, relative) and local filesystem paths.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Convert a path to absolute without resolving symlinks.
///
/// # Arguments
/// * `path` - Path to convert (relative or absolute)
///
/// # Returns
/// Absolute path, joining with current directory if relative.
///
/// # Errors
/// Returns error if current directory cannot be determined.
pub fn to_absolute(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        std::env::current_dir()
            .map(|cwd: PathBuf| cwd.join(path))
            .map_err(|e: std::io::Error| PathError::IoError {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// Lexical path normalization without filesystem access.
///
/// Removes `.` components and resolves `..` components lexically.
/// Does not access the filesystem or resolve symlinks.
///
/// # Arguments
/// * `path` - Path to normalize
///
/// # Returns
/// Normalized path with `.` and `..` resolved lexically.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => { /* skip . */ }
            Component::ParentDir => {
                if !components.is_empty()
                    && !matches!(
                        components.last(),
                        Some(Component::ParentDir) | Some(Component::RootDir)
                    )
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Convert a path to POSIX-style string (forward slashes).
///
/// Remote namespace paths are always POSIX format.
///
/// # Arguments
/// * `path` - Path to convert
///
/// # Returns
/// String with forward slashes as separators.
pub fn to_posix_path(path: &Path) -> String {
    path.components()
        .map(|c: Component| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Convert a remote namespace path (POSIX format, relative) to a local path
/// under `root`.
///
/// Rejects absolute paths and paths that would escape `root` after lexical
/// normalization, so a hostile remote entry name can never address files
/// outside the staging directory.
///
/// # Arguments
/// * `remote_path` - POSIX-style relative path from the remote namespace
/// * `root` - Local root directory to resolve under
///
/// # Errors
/// Returns `PathError::InvalidPath` for absolute input and
/// `PathError::PathOutsideRoot` when `..` components escape the root.
pub fn from_posix_path(remote_path: &str, root: &Path) -> Result<PathBuf, PathError> {
    if remote_path.starts_with('/') {
        return Err(PathError::InvalidPath {
            path: remote_path.to_string(),
        });
    }

    let relative: PathBuf = remote_path.split('/').filter(|s| !s.is_empty()).collect();
    let joined: PathBuf = root.join(relative);
    let normalized: PathBuf = lexical_normalize(&joined);

    if !normalized.starts_with(root) {
        return Err(PathError::PathOutsideRoot {
            path: remote_path.to_string(),
            root: root.display().to_string(),
        });
    }

    Ok(normalized)
}
