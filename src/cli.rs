use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Local,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServerCommands {
    #[command(about = "Run the developer HTTP server (health, run, SSE run stream)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8093)]
        port: u16,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  counsel-cli ask \"Create a plan for building a web application with user authentication\"\n\
  counsel-cli --provider openai --model gpt-4o-mini chat\n\
  counsel-cli --provider local --endpoint http://localhost:5273/v1 ask \"Plan a product launch\"\n\
  counsel-cli server serve --host 127.0.0.1 --port 8093\n\
  counsel-cli telemetry report --limit 2000\n\
  counsel-cli profiles show\n\
  counsel-cli doctor\n\
\n\
Pipeline behavior:\n\
  - Every request flows through three agents in sequence: planner, researcher, advisor.\n\
  - The advisor's output is the final answer; intermediate outputs stream as they arrive.\n\
  - Use --stage-timeout-secs to bound each stage's model invocation.";

#[derive(Debug, Parser)]
#[command(name = "counsel-cli")]
#[command(about = "Plan → Research → Advisor agent pipeline over an OpenAI-compatible endpoint")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "COUNSEL_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "COUNSEL_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "COUNSEL_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "COUNSEL_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "COUNSEL_CONFIG", default_value = ".counsel/config.toml")]
    pub config_path: String,

    #[arg(long, env = "COUNSEL_APP_NAME")]
    pub app_name: Option<String>,

    #[arg(long, env = "COUNSEL_STAGE_TIMEOUT_SECS")]
    pub stage_timeout_secs: Option<u64>,

    #[arg(long, env = "COUNSEL_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "COUNSEL_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a one-shot request through the full pipeline and print the result")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Run interactive chat mode over the pipeline")]
    Chat,
    #[command(about = "Validate provider environment and pipeline configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
    #[command(about = "Developer server mode")]
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Chat => "chat".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { .. } => "server.serve".to_string(),
        },
    }
}
