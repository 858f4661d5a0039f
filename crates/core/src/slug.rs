// crates/core/src/slug.rs
// Slug derivation for repositories and projects. Slugs feed the
// deterministic entry-id hash, so the rules here must stay stable.

use std::path::Path;

/// Lowercase, hyphenate, and strip a name down to `[a-z0-9_-]`.
///
/// Runs of invalid characters collapse into a single `-`; leading and
/// trailing hyphens are trimmed. An empty result falls back to `fallback`.
pub fn slugify(name: &str, fallback: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_hyphen = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            slug.push(ch);
            last_was_hyphen = ch == '-';
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Slug of the repository root's final path component.
pub fn repo_slug(repo_root: &Path) -> String {
    let name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    slugify(&name, "unknown-repo")
}

/// Slug of a project name.
pub fn project_slug(name: &str) -> String {
    slugify(name, "unknown-project")
}
