// crates/core/src/docs/links.rs
// Markdown crosslink extraction for validate_crosslinks. Only intra-repo
// targets matter; external URLs and in-page anchors are skipped.

use regex_lite::Regex;

/// One link occurrence inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    /// 1-based line number.
    pub line: usize,
    pub text: String,
    /// Raw target as written, with any `#fragment` removed.
    pub target: String,
}

/// Extract intra-repo link targets from Markdown.
pub fn extract_links(content: &str) -> Vec<LinkRef> {
    let re = Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").expect("static regex");
    let mut links = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for caps in re.captures_iter(line) {
            let raw_target = caps[2].trim();
            if raw_target.starts_with("http://")
                || raw_target.starts_with("https://")
                || raw_target.starts_with("mailto:")
                || raw_target.starts_with('#')
            {
                continue;
            }
            let target = raw_target.split('#').next().unwrap_or("").trim();
            if target.is_empty() {
                continue;
            }
            links.push(LinkRef {
                line: idx + 1,
                text: caps[1].to_string(),
                target: target.to_string(),
            });
        }
    }
    links
}
