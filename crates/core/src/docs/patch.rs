// crates/core/src/docs/patch.rs
// Patch application with hash preconditions.
//
// Structured mode takes a list of typed operations, each optionally
// guarded by the SHA-256 of the document as that operation sees it.
// Unified mode applies a standard unified diff; the caller checks the
// whole-file pre-image hash before invoking.

use serde::{Deserialize, Serialize};

use crate::docs::sections::{replace_range, replace_section};
use crate::error::DocError;
use crate::integrity::sha256_hex;

/// One structured edit operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOperation {
    ReplaceSection {
        anchor: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_hash: Option<String>,
    },
    ReplaceRange {
        start_line: usize,
        end_line: usize,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_hash: Option<String>,
    },
    ReplaceText {
        find: String,
        replace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_hash: Option<String>,
    },
    Append {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_hash: Option<String>,
    },
}

impl EditOperation {
    fn expected_hash(&self) -> Option<&str> {
        match self {
            Self::ReplaceSection { expected_hash, .. }
            | Self::ReplaceRange { expected_hash, .. }
            | Self::ReplaceText { expected_hash, .. }
            | Self::Append { expected_hash, .. } => expected_hash.as_deref(),
        }
    }
}

/// Apply structured operations in order. Each operation's hash
/// precondition is checked against the document as previous operations
/// left it, so a stale multi-op edit fails at the first divergence.
pub fn apply_structured_edit(
    content: &str,
    operations: &[EditOperation],
) -> Result<String, DocError> {
    let mut current = content.to_string();
    for operation in operations {
        if let Some(expected) = operation.expected_hash() {
            let actual = sha256_hex(current.as_bytes());
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(DocError::PatchHashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        current = match operation {
            EditOperation::ReplaceSection { anchor, content, .. } => {
                replace_section(&current, anchor, content)?
            }
            EditOperation::ReplaceRange {
                start_line,
                end_line,
                content,
                ..
            } => replace_range(&current, *start_line, *end_line, content)?,
            EditOperation::ReplaceText { find, replace, .. } => {
                if !current.contains(find.as_str()) {
                    return Err(DocError::MalformedPatch {
                        message: format!("replace_text target not found: {find:?}"),
                    });
                }
                current.replace(find.as_str(), replace)
            }
            EditOperation::Append { content: tail, .. } => {
                let mut next = current.clone();
                if !next.is_empty() && !next.ends_with('\n') {
                    next.push('\n');
                }
                next.push_str(tail);
                next
            }
        };
    }
    Ok(current)
}

/// Apply a unified diff to `content`.
///
/// Context and deletion lines must match the document exactly at the hunk
/// position; any divergence is `MalformedPatch`. Hash preconditions over
/// the pre-image are the caller's job.
pub fn apply_unified_patch(content: &str, patch: &str) -> Result<String, DocError> {
    let source_lines: Vec<&str> = content.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(source_lines.len());
    let mut cursor = 0usize; // next unconsumed source line (0-based)

    let mut lines = patch.lines().peekable();
    let mut saw_hunk = false;
    while let Some(line) = lines.next() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            continue;
        }
        let Some(header) = line.strip_prefix("@@") else {
            if line.trim().is_empty() && !saw_hunk {
                continue;
            }
            return Err(DocError::MalformedPatch {
                message: format!("unexpected line outside hunk: {line:?}"),
            });
        };
        saw_hunk = true;

        let old_start = parse_hunk_old_start(header).ok_or_else(|| DocError::MalformedPatch {
            message: format!("bad hunk header: @@{header}"),
        })?;
        // Copy unchanged lines up to the hunk start (1-based header).
        let hunk_begin = old_start.saturating_sub(1);
        if hunk_begin < cursor || hunk_begin > source_lines.len() {
            return Err(DocError::MalformedPatch {
                message: format!("hunk start {old_start} out of order"),
            });
        }
        out.extend(source_lines[cursor..hunk_begin].iter().map(|s| s.to_string()));
        cursor = hunk_begin;

        // Consume hunk body.
        while let Some(body) = lines.peek() {
            let body = *body;
            if body.starts_with("@@") {
                break;
            }
            lines.next();
            if body == r"\ No newline at end of file" {
                continue;
            }
            match body.chars().next() {
                Some(' ') | None => {
                    let expected = if body.is_empty() { "" } else { &body[1..] };
                    match source_lines.get(cursor) {
                        Some(actual) if *actual == expected => {
                            out.push(expected.to_string());
                            cursor += 1;
                        }
                        other => {
                            return Err(DocError::MalformedPatch {
                                message: format!(
                                    "context mismatch at line {}: expected {:?}, found {:?}",
                                    cursor + 1,
                                    expected,
                                    other
                                ),
                            })
                        }
                    }
                }
                Some('-') => {
                    let expected = &body[1..];
                    match source_lines.get(cursor) {
                        Some(actual) if *actual == expected => cursor += 1,
                        other => {
                            return Err(DocError::MalformedPatch {
                                message: format!(
                                    "deletion mismatch at line {}: expected {:?}, found {:?}",
                                    cursor + 1,
                                    expected,
                                    other
                                ),
                            })
                        }
                    }
                }
                Some('+') => out.push(body[1..].to_string()),
                Some(_) => {
                    return Err(DocError::MalformedPatch {
                        message: format!("unknown hunk line prefix: {body:?}"),
                    })
                }
            }
        }
    }

    if !saw_hunk {
        return Err(DocError::MalformedPatch {
            message: "patch contains no hunks".into(),
        });
    }

    out.extend(source_lines[cursor..].iter().map(|s| s.to_string()));
    let mut result = out.join("\n");
    if content.ends_with('\n') || result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn parse_hunk_old_start(header: &str) -> Option<usize> {
    // " -12,4 +12,5 @@" → 12
    let after_minus = header.trim_start().strip_prefix('-')?;
    let digits: String = after_minus.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Render a unified diff between two document states (used by dry-run
/// responses so callers can re-apply the exact change).
pub fn render_unified_diff(before: &str, after: &str, label: &str) -> String {
    similar::TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .to_string()
}
