use anyhow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Workflow,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Workflow => "WORKFLOW",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set provider credentials (for example OPENAI_API_KEY) or point COUNSEL_ENDPOINT \
                 at a running OpenAI-compatible endpoint."
            }
            ErrorCategory::Workflow => {
                "A pipeline stage failed. Check that the model endpoint is reachable and retry \
                 with RUST_LOG=info for per-stage logs."
            }
            ErrorCategory::Input => "Run counsel-cli --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("no model endpoint configured")
        || msg.contains("no model identifier configured")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("stage") || msg.contains("workflow") || msg.contains("topology") {
        return ErrorCategory::Workflow;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("prompt")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {}\nHint: {}", category.code(), err, category.hint())
}
