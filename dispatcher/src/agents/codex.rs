//! `codex` CLI integration.

use super::{AgentAdapter, ExecRequest, InteractiveRequest};

pub struct CodexAdapter;

fn exec_base(model: Option<&str>) -> Vec<String> {
    let mut argv = vec![
        "codex".to_string(),
        "exec".to_string(),
        "--sandbox".to_string(),
        "danger-full-access".to_string(),
        "--skip-git-repo-check".to_string(),
    ];
    if let Some(model) = model {
        argv.push("-m".to_string());
        argv.push(model.to_string());
    }
    argv
}

impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn headless_argv(&self, request: &ExecRequest) -> Vec<String> {
        let mut argv = exec_base(request.model.as_deref());
        argv.push(request.prompt.clone());
        argv
    }

    fn session_argv(&self, request: &ExecRequest) -> Vec<String> {
        // `-` reads the prompt from stdin.
        let mut argv = exec_base(request.model.as_deref());
        argv.push("-".to_string());
        argv
    }

    fn interactive_argv(&self, request: &InteractiveRequest) -> Vec<String> {
        // codex takes no initial prompt interactively; the operator types it.
        let mut argv = vec!["codex".to_string()];
        if let Some(model) = &request.model {
            argv.push("-m".to_string());
            argv.push(model.clone());
        }
        argv
    }
}
