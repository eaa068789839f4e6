//! Repository path helpers
//!
//! Paths are absolute within the repository, `/`-separated, with `/` as the
//! root and no trailing slash (`/dir/file.txt`).

/// Path of the repository root
pub const ROOT: &str = "/";

/// Append `name` to the directory path `parent`
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Non-empty components of `path`
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

/// Canonical form of a user-supplied path (`a//b/` becomes `/a/b`)
pub fn normalize(path: &str) -> String {
    let mut result = String::from(ROOT);
    for (i, part) in components(path).enumerate() {
        if i > 0 {
            result.push('/');
        }
        result.push_str(part);
    }
    result
}

/// Split into parent directory and final name. The root has no parent.
pub fn split(path: &str) -> Option<(String, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((normalize(parent), name))
}

/// `path` relative to the directory `dir`, if it lies below it
pub fn relative<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    if dir == ROOT {
        return path.strip_prefix('/');
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}
