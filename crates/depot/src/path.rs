//! Depot path validation and remapping.
//!
//! Depot paths are `//`-rooted, `/`-separated strings. A branch root is a
//! depot path prefix ending in `/`; everything under it is addressed by a
//! path relative to that root, which is what allows a snapshot taken on one
//! branch to be replayed against another.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Characters the depot reserves for revision and wildcard syntax.
pub const RESERVED: [char; 4] = ['@', '#', '%', '*'];

/// `true` if a file name can be expressed as a depot path (contains none of
/// the [`RESERVED`] characters).
pub fn is_valid_file_name(name: impl AsRef<str>) -> bool {
    !name.as_ref().contains(RESERVED)
}

/// Validates a depot path for a single file.
///
/// # Examples
///
/// ```
/// use depotsync_depot::validate_path;
/// assert!(validate_path("//depot/main/file.txt").is_ok());
/// assert!(validate_path("depot/main/file.txt").is_err());
/// assert!(validate_path("//depot/main/file@1.txt").is_err());
/// assert!(validate_path("//depot/main/../secret").is_err());
/// ```
pub fn validate(path: impl AsRef<str>) -> Result<String> {
    let path = path.as_ref();
    let Some(rest) = path.strip_prefix("//") else {
        exn::bail!(ErrorKind::InvalidPath(path.to_string()));
    };
    if rest.is_empty() || rest.ends_with('/') || rest.contains('\0') || !is_valid_file_name(rest) {
        exn::bail!(ErrorKind::InvalidPath(path.to_string()));
    }
    if rest.split('/').any(|segment| matches!(segment, "" | "." | ".." | "...")) {
        exn::bail!(ErrorKind::InvalidPath(path.to_string()));
    }
    Ok(path.to_string())
}

/// Normalizes a branch root so that it always ends with exactly one `/`.
///
/// ```
/// use depotsync_depot::path::branch_root;
/// assert_eq!(branch_root("//depot/main"), "//depot/main/");
/// assert_eq!(branch_root("//depot/main/..."), "//depot/main/");
/// assert_eq!(branch_root("//depot/main//"), "//depot/main/");
/// ```
pub fn branch_root(root: impl AsRef<str>) -> String {
    let root = root.as_ref().trim();
    let root = root.strip_suffix("...").unwrap_or(root);
    format!("{}/", root.trim_end_matches('/'))
}

/// Returns the part of `path` below `root`, if `path` lives under it.
pub fn relative<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    path.strip_prefix(root).filter(|rest| !rest.is_empty())
}

/// Moves `path` from one branch root to another.
///
/// ```
/// use depotsync_depot::path::remap;
/// assert_eq!(
///     remap("//depot/main/src/lib.rs", "//depot/main/", "//depot/release/").as_deref(),
///     Some("//depot/release/src/lib.rs")
/// );
/// assert_eq!(remap("//other/src/lib.rs", "//depot/main/", "//depot/release/"), None);
/// ```
pub fn remap(path: &str, from_root: &str, to_root: &str) -> Option<String> {
    relative(path, from_root).map(|rest| format!("{to_root}{rest}"))
}

/// Joins a local path (relative to the branch's local root) onto a depot
/// branch root, converting platform separators to `/`.
///
/// Returns `None` if the relative path tries to leave the root.
pub fn depot_path_for(root: &str, relative_local: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in relative_local.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_str()?.to_string()),
            Component::CurDir => {},
            _ => return None,
        }
    }
    match segments.is_empty() {
        true => None,
        false => Some(format!("{root}{}", segments.join("/"))),
    }
}

/// Resolves a path relative to a branch root onto that branch's local folder.
pub fn local_path_for(local_root: &Path, relative_depot: &str) -> PathBuf {
    relative_depot.split('/').filter(|s| !s.is_empty()).fold(local_root.to_path_buf(), |acc, s| acc.join(s))
}

/// Flattens a depot path into something usable inside a file name, e.g.
/// `//depot/main/` becomes `--depot-main-`.
pub fn flatten(path: &str) -> String {
    path.replace('/', "-")
}
