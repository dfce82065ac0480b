//! `claude` CLI integration.

use super::{AgentAdapter, ExecRequest, InteractiveRequest};

pub struct ClaudeAdapter;

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn headless_argv(&self, request: &ExecRequest) -> Vec<String> {
        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            request.prompt.clone(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = &request.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv
    }

    fn session_argv(&self, request: &ExecRequest) -> Vec<String> {
        // `-p` without a positional prompt reads stdin.
        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = &request.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv
    }

    fn interactive_argv(&self, request: &InteractiveRequest) -> Vec<String> {
        let mut argv = vec!["claude".to_string()];
        if let Some(model) = &request.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        if let Some(prompt) = &request.prompt {
            argv.push(prompt.clone());
        }
        argv
    }
}
