//! Worker prompt rendering.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::plan::{Plan, TodoItem, todo_display};
use crate::io::plan_doc::PlanDoc;

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        Self { env }
    }

    /// Render the prompt for one TODO. TODO numbering in the output is
    /// 1-based; internal indices stay 0-based.
    pub fn render_worker_prompt(
        &self,
        plan: &Plan,
        doc: &PlanDoc,
        todo: &TodoItem,
    ) -> Result<String> {
        let remaining: Vec<&str> = doc
            .todos
            .iter()
            .filter(|t| !t.done && t.index != todo.index)
            .map(|t| t.text.as_str())
            .collect();
        let template = self.env.get_template("worker")?;
        let rendered = template.render(context! {
            plan_id => plan.id,
            plan_title => doc.title,
            branch => plan.branch,
            plan_path => plan.plan_path.display().to_string(),
            todo_label => todo_display(todo.index),
            todo_text => todo.text,
            change_request => plan.change_request.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            remaining => (!remaining.is_empty()).then_some(remaining),
        })?;
        Ok(rendered)
    }
}
