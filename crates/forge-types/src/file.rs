use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    /// Returns `None` when `path` is not a safe project-relative path.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Option<Self> {
        let path = path.into();
        if !is_safe_relative_path(&path) {
            return None;
        }
        Some(Self {
            path,
            content: content.into(),
        })
    }
}

/// A path is safe when it is non-empty, relative, and never climbs above the
/// project root. Both `/` and `\` count as separators.
pub fn is_safe_relative_path(path: &str) -> bool {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed != path {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains('\0') {
        return false;
    }
    // drive prefixes such as `C:` or `c:\`
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return false;
    }

    let mut depth: usize = 0;
    let mut saw_segment = false;
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            _ => {
                depth += 1;
                saw_segment = true;
            }
        }
    }
    saw_segment && depth > 0
}
