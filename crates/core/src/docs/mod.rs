// crates/core/src/docs/mod.rs
//! Markdown document mechanics: section anchors, line-range edits, patch
//! application, and crosslink extraction. Pure text-in/text-out; the
//! orchestration (locking, atomic writes, change recording) lives in the
//! server's document manager.

pub mod links;
pub mod patch;
pub mod sections;

pub use links::{extract_links, LinkRef};
pub use patch::{apply_structured_edit, apply_unified_patch, EditOperation};
pub use sections::{
    generate_toc, list_checklist_items, list_sections, normalize_headers, replace_range,
    replace_section, split_frontmatter, ChecklistItem, SectionInfo,
};
