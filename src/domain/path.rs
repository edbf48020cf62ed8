//! Materialized path helpers.
//!
//! A path is the dot-joined chain of sanitized names from the root down to a
//! node, e.g. `frame_material.material_type.wood`. Descendant and ancestor
//! queries become prefix tests on these strings.

/// Segment separator inside a materialized path.
pub const SEPARATOR: char = '.';

/// Lowercase the name and replace every non-alphanumeric character with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Path of a node named `name` under a parent at `parent_path` (None for roots).
pub fn child_path(parent_path: Option<&str>, name: &str) -> String {
    match parent_path {
        Some(parent) => format!("{parent}{SEPARATOR}{}", sanitize(name)),
        None => sanitize(name),
    }
}

/// True if `path` lies strictly below `ancestor`.
pub fn is_descendant_of(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path[ancestor.len()..].starts_with(SEPARATOR)
}

/// Paths of every proper ancestor, root first.
///
/// `a.b.c` → `["a", "a.b"]`
pub fn ancestor_paths(path: &str) -> Vec<String> {
    path.match_indices(SEPARATOR)
        .map(|(idx, _)| path[..idx].to_string())
        .collect()
}

/// Last segment of the path (the node's own sanitized name).
pub fn leaf_segment(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}
