// crates/core/src/template.rs
// Template rendering for rotated-log headers and the special document
// kinds. The engine is a collaborator contract: side-effect-free
// `(template_name, metadata) -> text`. The built-in implementation does
// `{placeholder}` substitution over a fixed catalog; a rotation must
// always succeed even when rendering fails, so a minimal hand-written
// header exists as the fallback.

use std::collections::BTreeMap;

/// Side-effect-free template renderer.
pub trait TemplateEngine: Send + Sync {
    /// Render `template_name` with `metadata` substitutions. `None` when
    /// the template is unknown.
    fn render(&self, template_name: &str, metadata: &BTreeMap<String, String>) -> Option<String>;
}

/// Built-in catalog keyed by template name.
#[derive(Debug, Default, Clone)]
pub struct BuiltinTemplates;

impl BuiltinTemplates {
    fn catalog(name: &str) -> Option<&'static str> {
        match name {
            "progress_log" | "log_header" => Some(
                "# {title}\n\nLog rotated on {timestamp} (rotation id {rotation_id}) for project {project}.\nPrevious log was archived to: {archive_name}\n\n",
            ),
            "doc_log" => Some(
                "# Documentation Log\n\nLog rotated on {timestamp} (rotation id {rotation_id}) for project {project}.\nPrevious log was archived to: {archive_name}\n\n",
            ),
            "security_log" => Some(
                "# Security Log\n\nLog rotated on {timestamp} (rotation id {rotation_id}) for project {project}.\nPrevious log was archived to: {archive_name}\n\n",
            ),
            "bug_log" => Some(
                "# Bug Log\n\nLog rotated on {timestamp} (rotation id {rotation_id}) for project {project}.\nPrevious log was archived to: {archive_name}\n\n",
            ),
            "research_doc" => Some(
                "# {title}\n\n<!-- ID: summary -->\n## Summary\n\n{summary}\n\n<!-- ID: findings -->\n## Findings\n\n_Pending._\n\n<!-- ID: references -->\n## References\n\n_None yet._\n",
            ),
            "bug_report" => Some(
                "# Bug: {title}\n\n<!-- ID: details -->\n## Details\n\n- Severity: {severity}\n- Component: {component}\n- Status: {status}\n- Reported: {timestamp}\n\n<!-- ID: reproduction -->\n## Reproduction\n\n{reproduction}\n\n<!-- ID: resolution -->\n## Resolution\n\n_Open._\n",
            ),
            "review_report" => Some(
                "# Review: {title}\n\n<!-- ID: scope -->\n## Scope\n\n{scope}\n\n<!-- ID: findings -->\n## Findings\n\n_Pending._\n\n<!-- ID: verdict -->\n## Verdict\n\n_Pending._\n",
            ),
            "agent_report_card" => Some(
                "# Agent Report Card: {agent}\n\n<!-- ID: period -->\n## Period\n\n{period}\n\n<!-- ID: highlights -->\n## Highlights\n\n{highlights}\n\n<!-- ID: scores -->\n## Scores\n\n_Pending._\n",
            ),
            _ => None,
        }
    }
}

impl TemplateEngine for BuiltinTemplates {
    fn render(&self, template_name: &str, metadata: &BTreeMap<String, String>) -> Option<String> {
        let template = Self::catalog(template_name)?;
        Some(substitute(template, metadata))
    }
}

/// Replace `{key}` placeholders; unknown keys render as empty strings.
fn substitute(template: &str, metadata: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close_rel) => {
                let key = &rest[open + 1..open + close_rel];
                if let Some(value) = metadata.get(key) {
                    out.push_str(value);
                }
                rest = &rest[open + close_rel + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Minimal header used when template rendering fails during rotation.
pub fn fallback_rotation_header(
    title: &str,
    project: &str,
    rotation_id: &str,
    timestamp: &str,
    archive_name: &str,
) -> String {
    format!(
        "# {title}\n\nLog rotated on {timestamp} (rotation id {rotation_id}) for project {project}.\nPrevious log was archived to: {archive_name}\n\n"
    )
}
