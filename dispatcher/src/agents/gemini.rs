//! `gemini` CLI integration.

use super::{AgentAdapter, ExecRequest, InteractiveRequest};

pub struct GeminiAdapter;

impl AgentAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn headless_argv(&self, request: &ExecRequest) -> Vec<String> {
        let mut argv = vec![
            "gemini".to_string(),
            "--yolo".to_string(),
            "-p".to_string(),
            request.prompt.clone(),
        ];
        if let Some(model) = &request.model {
            argv.push("-m".to_string());
            argv.push(model.clone());
        }
        argv
    }

    fn session_argv(&self, request: &ExecRequest) -> Vec<String> {
        // Piped stdin is treated as the prompt.
        let mut argv = vec!["gemini".to_string(), "--yolo".to_string()];
        if let Some(model) = &request.model {
            argv.push("-m".to_string());
            argv.push(model.clone());
        }
        argv
    }

    fn interactive_argv(&self, request: &InteractiveRequest) -> Vec<String> {
        let mut argv = vec!["gemini".to_string()];
        if let Some(model) = &request.model {
            argv.push("-m".to_string());
            argv.push(model.clone());
        }
        if let Some(prompt) = &request.prompt {
            argv.push("-i".to_string());
            argv.push(prompt.clone());
        }
        argv
    }
}
