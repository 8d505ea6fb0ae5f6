//! Conversions between absolute virtual paths (`/articles/a.md`) used by the
//! file store and repo-relative paths (`articles/a.md`) used by the remote.

/// Strip the leading slash of a virtual path.
/// Returns `None` for the root and for paths containing empty or dot segments.
pub fn to_repo_path(virtual_path: &str) -> Option<String> {
    let trimmed = virtual_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let valid = trimmed
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    valid.then(|| trimmed.to_string())
}

pub fn to_virtual_path(repo_path: &str) -> String {
    format!("/{}", repo_path.trim_start_matches('/'))
}

/// Parent directory of a virtual path, `None` for the root.
pub fn parent(virtual_path: &str) -> Option<&str> {
    if virtual_path == "/" || virtual_path.is_empty() {
        return None;
    }
    match virtual_path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&virtual_path[..idx]),
        None => None,
    }
}

/// Whether `path` equals `ancestor` or lives somewhere below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path.starts_with('/');
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Whether a repo-relative path belongs to one of the tracked roots.
pub fn in_tracked_roots(repo_path: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| {
        repo_path == root
            || (repo_path.starts_with(root.as_str())
                && repo_path.as_bytes().get(root.len()) == Some(&b'/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_strips_slash() {
        assert_eq!(
            to_repo_path("/articles/20240101_hello.md").as_deref(),
            Some("articles/20240101_hello.md")
        );
        assert_eq!(to_repo_path("/"), None);
        assert_eq!(to_repo_path(""), None);
        assert_eq!(to_repo_path("/articles//a.md"), None);
        assert_eq!(to_repo_path("/articles/../etc"), None);
    }

    #[test]
    fn virtual_path_adds_slash() {
        assert_eq!(to_virtual_path("books/b/config.yaml"), "/books/b/config.yaml");
        assert_eq!(to_virtual_path("/images/a.png"), "/images/a.png");
    }

    #[test]
    fn parent_walks_up() {
        assert_eq!(parent("/articles/a.md"), Some("/articles"));
        assert_eq!(parent("/articles"), Some("/"));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn within_respects_segment_boundaries() {
        assert!(is_within("/articles/a.md", "/articles"));
        assert!(is_within("/articles", "/articles"));
        assert!(!is_within("/articles2/a.md", "/articles"));
        assert!(is_within("/books", "/"));
    }

    #[test]
    fn tracked_roots_membership() {
        let roots = vec!["articles".to_string(), "images".to_string()];
        assert!(in_tracked_roots("articles/a.md", &roots));
        assert!(in_tracked_roots("images", &roots));
        assert!(!in_tracked_roots("articles-old/a.md", &roots));
        assert!(!in_tracked_roots("README.md", &roots));
    }
}
