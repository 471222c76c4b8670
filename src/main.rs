use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::level_filters::LevelFilter;

use counsel_cli::chat::run_chat;
use counsel_cli::cli::{
    Cli, Commands, ProfileCommands, ServerCommands, TelemetryCommands, command_label,
};
use counsel_cli::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use counsel_cli::doctor::run_doctor;
use counsel_cli::error::{categorize_error, format_cli_error};
use counsel_cli::pipeline::build_advisory_pipeline;
use counsel_cli::profiles::{run_profiles_list, run_profiles_show};
use counsel_cli::provider::resolve_model;
use counsel_cli::server::run_server;
use counsel_cli::streaming::run_workflow_streaming;
use counsel_cli::telemetry::{TelemetrySink, run_telemetry_report};
use counsel_cli::workflow::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(&cfg, command_label(&cli.command));
    let started_at = Instant::now();

    let result = match cli.command {
        Commands::Ask { prompt } => run_ask(&cfg, prompt, &telemetry).await,
        Commands::Chat => run_chat(cfg.clone(), &telemetry).await,
        Commands::Doctor => run_doctor(&cfg).await,
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg),
            ProfileCommands::Show => run_profiles_show(&cfg),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit),
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { host, port } => run_server(cfg, host, port, &telemetry).await,
        },
    };

    match &result {
        Ok(()) => telemetry.emit(
            "command.completed",
            json!({ "latency_ms": started_at.elapsed().as_millis() as u64 }),
        ),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "category": categorize_error(err).code(),
                "latency_ms": started_at.elapsed().as_millis() as u64
            }),
        ),
    }

    result
}

async fn run_ask(cfg: &RuntimeConfig, prompt: Vec<String>, telemetry: &TelemetrySink) -> Result<()> {
    let (model, resolved_provider, model_name) = resolve_model(cfg)?;
    tracing::info!(provider = ?resolved_provider, model = %model_name, "Using model");
    telemetry.emit(
        "model.resolved",
        json!({
            "provider": format!("{:?}", resolved_provider).to_ascii_lowercase(),
            "model": model_name,
            "path": "ask"
        }),
    );

    let workflow = Arc::new(build_advisory_pipeline(model)?);
    let runner = Runner::with_options(workflow, cfg.run_options());
    let prompt = prompt.join(" ");
    run_workflow_streaming(&runner, &prompt, telemetry).await?;
    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
