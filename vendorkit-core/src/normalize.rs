// Resolver path normalization

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Protocol tags the resolver appends to locator names (`core@npm`, `app@workspace`, ...)
const RESOLVER_TAGS: &[&str] = &[
    "workspace", "npm", "virtual", "patch", "file", "portal", "link", "exec",
];

fn tag_suffix() -> Option<&'static Regex> {
    static TAG_SUFFIX: OnceLock<Option<Regex>> = OnceLock::new();
    TAG_SUFFIX
        .get_or_init(|| {
            let pattern = format!("(?:@(?:{}))+$", RESOLVER_TAGS.join("|"));
            Regex::new(&pattern).ok()
        })
        .as_ref()
}

/// Strip resolver tag suffixes from the final segment of `path`.
///
/// Idempotent, and the identity on paths whose last segment carries no tag.
/// A segment that is nothing but a tag (e.g. the scope `@npm`) is left alone.
pub fn normalize(path: &Path) -> PathBuf {
    let Some(last) = path.file_name().and_then(|n| n.to_str()) else {
        return path.to_path_buf();
    };

    let Some(tags) = tag_suffix() else {
        return path.to_path_buf();
    };

    let stripped = tags.replace(last, "");
    if stripped.is_empty() || stripped == last {
        return path.to_path_buf();
    }

    path.with_file_name(stripped.as_ref())
}
