// crates/core/src/docs/sections.rs
// Section-anchored and line-ranged Markdown editing.
//
// Sections are delimited by `<!-- ID: name -->` comment lines. A section's
// body runs from the line after its anchor to the next anchor (or EOF).
// Line-ranged edits are 1-based and inclusive over the post-frontmatter
// body; `split_frontmatter` reports the offset callers need to translate
// file lines to body lines.

use regex_lite::Regex;

use crate::error::DocError;

/// One addressable section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub anchor: String,
    /// 1-based line number of the anchor comment within the whole file.
    pub line: usize,
    /// First heading line inside the section, if any.
    pub heading: Option<String>,
}

/// One checklist item (`- [ ]` / `- [x]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistItem {
    /// 1-based line number within the whole file.
    pub line: usize,
    pub checked: bool,
    pub text: String,
}

fn anchor_regex() -> Regex {
    Regex::new(r"^<!--\s*ID:\s*([A-Za-z0-9][A-Za-z0-9_.-]*)\s*-->\s*$").expect("static regex")
}

/// Split YAML frontmatter off a document.
///
/// Returns `(body_line_offset, body)`: the number of leading file lines
/// that belong to the frontmatter block (0 when there is none) and the
/// remaining body text.
pub fn split_frontmatter(content: &str) -> (usize, &str) {
    let mut lines = content.split_inclusive('\n');
    let first_len = match lines.next() {
        Some(first) if first.trim_end() == "---" => first.len(),
        _ => return (0, content),
    };

    let mut offset_bytes = first_len;
    let mut line_count = 1usize;
    for line in lines {
        line_count += 1;
        offset_bytes += line.len();
        if line.trim_end() == "---" {
            return (line_count, &content[offset_bytes..]);
        }
    }
    // Unterminated frontmatter: treat the whole document as body.
    (0, content)
}

/// List all section anchors, plus duplicate-anchor warnings as
/// `(anchor, line_numbers)` pairs.
pub fn list_sections(content: &str) -> (Vec<SectionInfo>, Vec<(String, Vec<usize>)>) {
    let re = anchor_regex();
    let mut sections: Vec<SectionInfo> = Vec::new();

    let lines: Vec<&str> = content.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = re.captures(line) {
            sections.push(SectionInfo {
                anchor: caps[1].to_string(),
                line: idx + 1,
                heading: None,
            });
        }
    }

    // Attach the first heading found inside each section.
    for i in 0..sections.len() {
        let start = sections[i].line; // line after the anchor, 0-based
        let end = sections
            .get(i + 1)
            .map(|s| s.line - 1)
            .unwrap_or(lines.len());
        sections[i].heading = lines[start..end]
            .iter()
            .find(|l| l.trim_start().starts_with('#'))
            .map(|l| l.trim().to_string());
    }

    let mut duplicates: Vec<(String, Vec<usize>)> = Vec::new();
    for section in &sections {
        let occurrences: Vec<usize> = sections
            .iter()
            .filter(|s| s.anchor == section.anchor)
            .map(|s| s.line)
            .collect();
        if occurrences.len() > 1 && !duplicates.iter().any(|(a, _)| *a == section.anchor) {
            duplicates.push((section.anchor.clone(), occurrences));
        }
    }

    (sections, duplicates)
}

/// Replace the body of the section identified by `anchor`.
///
/// The anchor line itself is preserved; content between it and the next
/// anchor (or EOF) is swapped for `new_body`.
pub fn replace_section(content: &str, anchor: &str, new_body: &str) -> Result<String, DocError> {
    let (sections, _) = list_sections(content);
    let target = sections
        .iter()
        .find(|s| s.anchor == anchor)
        .ok_or_else(|| DocError::SectionNotFound {
            anchor: anchor.to_string(),
        })?;

    let lines: Vec<&str> = content.lines().collect();
    let body_start = target.line; // 0-based index of the first body line
    let body_end = sections
        .iter()
        .find(|s| s.line > target.line)
        .map(|s| s.line - 1)
        .unwrap_or(lines.len());

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    out.extend(lines[..body_start].iter().map(|s| s.to_string()));
    let body = new_body.trim_end_matches('\n');
    if !body.is_empty() {
        out.extend(body.split('\n').map(|s| s.to_string()));
    }
    out.extend(lines[body_end..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

/// Replace an inclusive, 1-based line range of the post-frontmatter body.
pub fn replace_range(
    content: &str,
    start_line: usize,
    end_line: usize,
    new_text: &str,
) -> Result<String, DocError> {
    let (offset, body) = split_frontmatter(content);
    let body_lines: Vec<&str> = body.lines().collect();

    if start_line == 0 || end_line < start_line || end_line > body_lines.len() {
        return Err(DocError::RangeOutOfBounds {
            start: start_line,
            end: end_line,
            body_lines: body_lines.len(),
        });
    }

    let file_lines: Vec<&str> = content.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(file_lines.len());
    out.extend(file_lines[..offset + start_line - 1].iter().map(|s| s.to_string()));
    let replacement = new_text.trim_end_matches('\n');
    if !replacement.is_empty() {
        out.extend(replacement.split('\n').map(|s| s.to_string()));
    }
    out.extend(file_lines[offset + end_line..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

/// Normalize ATX headings: exactly one space after the `#` run and no
/// trailing hash decorations.
pub fn normalize_headers(content: &str) -> String {
    let re = Regex::new(r"^(#{1,6})\s*(.*?)\s*#*\s*$").expect("static regex");
    let mut out: Vec<String> = Vec::new();
    for line in content.lines() {
        if line.starts_with('#') {
            if let Some(caps) = re.captures(line) {
                let hashes = &caps[1];
                let title = caps[2].trim();
                out.push(if title.is_empty() {
                    hashes.to_string()
                } else {
                    format!("{hashes} {title}")
                });
                continue;
            }
        }
        out.push(line.to_string());
    }
    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Build a table-of-contents block from the document's headings.
///
/// Level-1 headings are treated as the document title and skipped.
pub fn generate_toc(content: &str) -> String {
    let mut toc = String::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if !(2..=6).contains(&level) || !trimmed[level..].starts_with(' ') {
            continue;
        }
        let title = trimmed[level..].trim();
        let slug: String = title
            .to_lowercase()
            .chars()
            .filter_map(|c| {
                if c.is_ascii_alphanumeric() {
                    Some(c)
                } else if c == ' ' || c == '-' {
                    Some('-')
                } else {
                    None
                }
            })
            .collect();
        let indent = "  ".repeat(level - 2);
        toc.push_str(&format!("{indent}- [{title}](#{slug})\n"));
    }
    toc
}

/// Extract checklist items from the whole document.
pub fn list_checklist_items(content: &str) -> Vec<ChecklistItem> {
    let re = Regex::new(r"^\s*[-*]\s*\[([ xX])\]\s+(.*)$").expect("static regex");
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            re.captures(line).map(|caps| ChecklistItem {
                line: idx + 1,
                checked: !caps[1].trim().is_empty(),
                text: caps[2].trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = "\
# Architecture Guide

<!-- ID: overview -->
## Overview

The system has three parts.

<!-- ID: components -->
## Components

- core
- db

<!-- ID: decisions -->
## Decisions

None yet.
";

    #[test]
    fn lists_sections_with_headings() {
        let (sections, duplicates) = list_sections(DOC);
        assert!(duplicates.is_empty());
        let anchors: Vec<&str> = sections.iter().map(|s| s.anchor.as_str()).collect();
        assert_eq!(anchors, vec!["overview", "components", "decisions"]);
        assert_eq!(sections[0].heading.as_deref(), Some("## Overview"));
        assert_eq!(sections[0].line, 3);
    }

    #[test]
    fn duplicate_anchors_are_reported_with_lines() {
        let doc = "<!-- ID: a -->\nbody\n<!-- ID: a -->\nmore\n";
        let (_, duplicates) = list_sections(doc);
        assert_eq!(duplicates, vec![("a".to_string(), vec![1, 3])]);
    }

    #[test]
    fn replace_section_swaps_body_only() {
        let updated = replace_section(DOC, "components", "## Components\n\n- core\n- db\n- server\n").unwrap();
        assert!(updated.contains("- server"));
        // Neighbor sections intact.
        assert!(updated.contains("## Overview\n\nThe system has three parts."));
        assert!(updated.contains("## Decisions\n\nNone yet."));
        // Anchor line preserved.
        assert_eq!(updated.matches("<!-- ID: components -->").count(), 1);
    }

    #[test]
    fn replace_last_section_extends_to_eof() {
        let updated = replace_section(DOC, "decisions", "## Decisions\n\nUse sqlite.\n").unwrap();
        assert!(updated.ends_with("Use sqlite.\n"));
    }

    #[test]
    fn replace_missing_section_errors() {
        let err = replace_section(DOC, "nope", "x").unwrap_err();
        assert!(matches!(err, DocError::SectionNotFound { .. }));
    }

    #[test]
    fn frontmatter_is_split_with_offset() {
        let doc = "---\ntitle: X\n---\nbody line 1\nbody line 2\n";
        let (offset, body) = split_frontmatter(doc);
        assert_eq!(offset, 3);
        assert_eq!(body, "body line 1\nbody line 2\n");

        let (offset, body) = split_frontmatter("no frontmatter\n");
        assert_eq!(offset, 0);
        assert_eq!(body, "no frontmatter\n");
    }

    #[test]
    fn replace_range_is_one_based_inclusive_over_body() {
        let doc = "---\ntitle: X\n---\nline a\nline b\nline c\n";
        let updated = replace_range(doc, 2, 3, "replaced\n").unwrap();
        assert_eq!(updated, "---\ntitle: X\n---\nline a\nreplaced\n");
    }

    #[test]
    fn replace_range_rejects_out_of_bounds() {
        let err = replace_range("one\ntwo\n", 1, 5, "x").unwrap_err();
        assert!(matches!(err, DocError::RangeOutOfBounds { body_lines: 2, .. }));
        let err = replace_range("one\ntwo\n", 0, 1, "x").unwrap_err();
        assert!(matches!(err, DocError::RangeOutOfBounds { .. }));
    }

    #[test]
    fn normalize_headers_fixes_spacing_and_trailing_hashes() {
        let doc = "#Title\n##  Spaced   ##\ntext # not a heading\n";
        let normalized = normalize_headers(doc);
        assert_eq!(normalized, "# Title\n## Spaced\ntext # not a heading\n");
    }

    #[test]
    fn toc_skips_title_and_indents_by_level() {
        let toc = generate_toc(DOC);
        assert_eq!(
            toc,
            "- [Overview](#overview)\n- [Components](#components)\n- [Decisions](#decisions)\n"
        );

        let nested = "# T\n## Alpha\n### Beta Sub\n";
        assert_eq!(generate_toc(nested), "- [Alpha](#alpha)\n  - [Beta Sub](#beta-sub)\n");
    }

    #[test]
    fn checklist_items_parse_state_and_text() {
        let doc = "# C\n- [ ] open task\n- [x] done task\n* [X] also done\n- not a task\n";
        let items = list_checklist_items(doc);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].checked, false);
        assert_eq!(items[0].text, "open task");
        assert_eq!(items[0].line, 2);
        assert!(items[1].checked);
        assert!(items[2].checked);
    }
}
