//! Path validation
//!
//! Virtual paths are absolute, `/`-separated and normalised. They never
//! climb above `/`, which is the root of the session's current domain.

/// `*` and `?` are never forwarded to the backing store.
pub fn contains_wildcards(path: &str) -> bool {
    path.contains(['*', '?'])
}

/// Resolves `target` (absolute, or relative to `cwd`) into a normalised
/// virtual path. Returns `None` when `..` would climb above the root.
pub fn resolve_path(cwd: &str, target: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    let start = if target.starts_with('/') { "" } else { cwd };

    for segment in start.split('/').chain(target.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    Some(format!("/{}", parts.join("/")))
}

/// Places a virtual path below a domain root.
pub fn join_root(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (root.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", path),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, path),
    }
}

/// Last component of a virtual path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_and_absolute_targets() {
        assert_eq!(resolve_path("/a/b", "c").as_deref(), Some("/a/b/c"));
        assert_eq!(resolve_path("/a/b", "/c").as_deref(), Some("/c"));
        assert_eq!(resolve_path("/a/b", "../c/./d").as_deref(), Some("/a/c/d"));
        assert_eq!(resolve_path("/", "").as_deref(), Some("/"));
    }

    #[test]
    fn climbing_above_root_is_refused() {
        assert_eq!(resolve_path("/a", "../.."), None);
        assert_eq!(resolve_path("/", ".."), None);
    }

    #[test]
    fn wildcards_are_detected() {
        assert!(contains_wildcards("/data/*.grib"));
        assert!(contains_wildcards("file?"));
        assert!(!contains_wildcards("/data/file"));
    }

    #[test]
    fn domain_root_prefixing() {
        assert_eq!(join_root("/", "/x"), "/x");
        assert_eq!(join_root("/ops", "/"), "/ops");
        assert_eq!(join_root("/ops/", "/x/y"), "/ops/x/y");
    }
}
