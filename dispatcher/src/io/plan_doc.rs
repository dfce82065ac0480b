//! Plan document parsing.
//!
//! A plan document is markdown: a `# ` title, `## ` sections, and an ordered
//! TODO list of `- [ ]` / `- [x]` checkbox lines. The parsed document owns the
//! TODO items; dispatcher state carries only the current index and retry
//! count.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::plan::TodoItem;

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-\s*\[( |x|X)\]\s+(.+)$").expect("checkbox regex"));

/// Parsed plan document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDoc {
    pub title: String,
    pub todos: Vec<TodoItem>,
    /// `## ` section bodies keyed by heading text.
    pub sections: BTreeMap<String, String>,
}

impl PlanDoc {
    /// First not-done, not-blocked TODO at or after `from_index`.
    pub fn first_open_todo(&self, from_index: usize) -> Option<&TodoItem> {
        self.todos
            .iter()
            .skip(from_index)
            .find(|todo| !todo.done && !todo.blocked)
    }

    pub fn all_done(&self) -> bool {
        self.todos.iter().all(|todo| todo.done)
    }
}

/// Parses plan documents into [`PlanDoc`].
pub trait PlanParser {
    fn parse(&self, path: &Path) -> Result<PlanDoc>;
}

/// Markdown checkbox parser.
#[derive(Debug, Clone, Default)]
pub struct MarkdownPlanParser;

impl PlanParser for MarkdownPlanParser {
    fn parse(&self, path: &Path) -> Result<PlanDoc> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
        parse_markdown(&contents)
            .with_context(|| format!("parse plan {}", path.display()))
    }
}

fn parse_markdown(contents: &str) -> Result<PlanDoc> {
    let mut title = None;
    let mut todos = Vec::new();
    let mut sections: BTreeMap<String, String> = BTreeMap::new();
    let mut current_section: Option<String> = None;

    for line in contents.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            if title.is_none() {
                title = Some(heading.trim().to_string());
            }
            continue;
        }
        if let Some(heading) = line.strip_prefix("## ") {
            current_section = Some(heading.trim().to_string());
            sections.entry(heading.trim().to_string()).or_default();
            continue;
        }
        if let Some(caps) = CHECKBOX_RE.captures(line) {
            let done = !caps[1].trim().is_empty();
            let raw = caps[2].trim();
            let blocked = raw.ends_with("(blocked)");
            let text = raw.trim_end_matches("(blocked)").trim().to_string();
            todos.push(TodoItem {
                index: todos.len(),
                text,
                done,
                blocked,
            });
            continue;
        }
        if let Some(section) = &current_section {
            let body = sections.entry(section.clone()).or_default();
            body.push_str(line);
            body.push('\n');
        }
    }

    let title = title.ok_or_else(|| anyhow!("plan document has no '# ' title"))?;
    if todos.is_empty() {
        return Err(anyhow!("plan document has no checkbox TODO items"));
    }
    for body in sections.values_mut() {
        *body = body.trim().to_string();
    }
    Ok(PlanDoc {
        title,
        todos,
        sections,
    })
}

/// Rewrite the checkbox for the TODO at `index` to done.
///
/// The document is the single source of truth for done flags, so the
/// Dispatcher updates it as TODOs complete.
pub fn mark_todo_done(path: &Path, index: usize) -> Result<()> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let mut seen = 0usize;
    let mut out = String::with_capacity(contents.len());
    let mut found = false;
    for line in contents.lines() {
        if !found && CHECKBOX_RE.is_match(line) {
            if seen == index {
                out.push_str(&line.replacen("[ ]", "[x]", 1));
                out.push('\n');
                seen += 1;
                found = true;
                continue;
            }
            seen += 1;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !found {
        return Err(anyhow!(
            "no open checkbox at index {index} in {}",
            path.display()
        ));
    }
    fs::write(path, out).with_context(|| format!("write plan {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Widget overhaul

Some intro prose.

## Context

Why we are doing this.

## Tasks

- [x] Survey the existing widgets
- [ ] Replace the frobnicator
- [ ] Ship the new panel (blocked)
- [ ] Update the docs
";

    #[test]
    fn parses_title_todos_and_sections() {
        let doc = parse_markdown(DOC).expect("parse");
        assert_eq!(doc.title, "Widget overhaul");
        assert_eq!(doc.todos.len(), 4);
        assert!(doc.todos[0].done);
        assert_eq!(doc.todos[1].text, "Replace the frobnicator");
        assert!(doc.todos[2].blocked);
        assert_eq!(doc.todos[2].text, "Ship the new panel");
        assert_eq!(doc.sections["Context"], "Why we are doing this.");
    }

    #[test]
    fn first_open_todo_skips_done_and_blocked() {
        let doc = parse_markdown(DOC).expect("parse");
        assert_eq!(doc.first_open_todo(0).expect("open").index, 1);
        assert_eq!(doc.first_open_todo(2).expect("open").index, 3);
        assert!(doc.first_open_todo(4).is_none());
    }

    #[test]
    fn rejects_documents_without_todos() {
        let err = parse_markdown("# Title only\n\nprose\n").unwrap_err();
        assert!(err.to_string().contains("no checkbox"));
    }

    #[test]
    fn mark_todo_done_rewrites_only_the_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PLAN.md");
        fs::write(&path, DOC).expect("write");

        mark_todo_done(&path, 1).expect("mark");
        let doc = MarkdownPlanParser.parse(&path).expect("parse");
        assert!(doc.todos[1].done);
        assert!(!doc.todos[3].done);
    }
}
