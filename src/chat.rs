use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::error::format_cli_error;
use crate::pipeline::build_advisory_pipeline;
use crate::provider::{parse_provider_name, resolve_model};
use crate::streaming::run_workflow_streaming;
use crate::telemetry::TelemetrySink;
use crate::workflow::Runner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Status,
    Help,
    Stages,
    Provider(String),
    Model(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChatCommand {
    NotACommand,
    Command(ChatCommand),
    MissingArgument { usage: &'static str },
    UnknownCommand(String),
}

pub fn parse_chat_command(input: &str) -> ParsedChatCommand {
    let trimmed = input.trim();

    if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("/exit") {
        return ParsedChatCommand::Command(ChatCommand::Exit);
    }

    if !trimmed.starts_with('/') {
        return ParsedChatCommand::NotACommand;
    }

    let slashless = trimmed.trim_start_matches('/');
    if slashless.is_empty() {
        return ParsedChatCommand::UnknownCommand("/".to_string());
    }

    let mut parts = slashless.splitn(2, char::is_whitespace);
    let command = parts
        .next()
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match command.as_str() {
        "exit" => ParsedChatCommand::Command(ChatCommand::Exit),
        "status" => ParsedChatCommand::Command(ChatCommand::Status),
        "help" => ParsedChatCommand::Command(ChatCommand::Help),
        "stages" => ParsedChatCommand::Command(ChatCommand::Stages),
        "provider" => {
            if arg.is_empty() {
                ParsedChatCommand::MissingArgument {
                    usage: "/provider <auto|openai|local>",
                }
            } else {
                ParsedChatCommand::Command(ChatCommand::Provider(arg.to_string()))
            }
        }
        "model" => {
            if arg.is_empty() {
                ParsedChatCommand::Command(ChatCommand::Model(None))
            } else {
                ParsedChatCommand::Command(ChatCommand::Model(Some(arg.to_string())))
            }
        }
        other => ParsedChatCommand::UnknownCommand(format!("/{other}")),
    }
}

pub fn print_chat_help() {
    println!("Chat commands:");
    println!("- /help: show command quick reference");
    println!("- /status: show active profile/provider/model");
    println!("- /stages: show the pipeline stages in execution order");
    println!("- /provider <name>: switch provider and rebuild the pipeline");
    println!("- /model <id>: switch model and rebuild the pipeline");
    println!("- /exit: end interactive chat");
}

pub fn print_chat_banner() {
    println!("Multi-agent advisory assistant.");
    println!("Requests run through three agents in sequence:");
    println!("- planner: turns your request into a structured plan");
    println!("- researcher: expands the plan with detailed research");
    println!("- advisor: synthesizes everything into final recommendations");
    println!();
    println!("Example requests:");
    println!("- Create a plan for building a web application with user authentication");
    println!("- Help me design a marketing strategy for a new product");
    println!("- Plan a machine learning project for customer segmentation");
    println!();
    println!("Type /help for commands or /exit to quit.");
}

pub enum ChatCommandAction {
    Continue,
    Exit,
}

fn build_chat_runner(cfg: &RuntimeConfig) -> Result<(Runner, Provider, String)> {
    let (model, resolved_provider, model_name) = resolve_model(cfg)?;
    let workflow = Arc::new(build_advisory_pipeline(model)?);
    Ok((
        Runner::with_options(workflow, cfg.run_options()),
        resolved_provider,
        model_name,
    ))
}

fn print_chat_stages(runner: &Runner) {
    println!("Pipeline stages (execution order):");
    for stage_id in runner.workflow().traversal_order() {
        let description = runner
            .workflow()
            .agent(stage_id)
            .map(|agent| agent.description().to_string())
            .unwrap_or_default();
        if description.is_empty() {
            println!("- {stage_id}");
        } else {
            println!("- {stage_id}: {description}");
        }
    }
}

pub async fn dispatch_chat_command(
    command: ChatCommand,
    cfg: &mut RuntimeConfig,
    runner: &mut Runner,
    resolved_provider: &mut Provider,
    model_name: &mut String,
    telemetry: &TelemetrySink,
) -> Result<ChatCommandAction> {
    match command {
        ChatCommand::Exit => Ok(ChatCommandAction::Exit),
        ChatCommand::Status => {
            println!(
                "profile={} provider={:?} model={}",
                cfg.profile, resolved_provider, model_name
            );
            Ok(ChatCommandAction::Continue)
        }
        ChatCommand::Help => {
            print_chat_help();
            Ok(ChatCommandAction::Continue)
        }
        ChatCommand::Stages => {
            print_chat_stages(runner);
            Ok(ChatCommandAction::Continue)
        }
        ChatCommand::Provider(provider_name) => {
            let new_provider = parse_provider_name(&provider_name)?;
            let mut switched_cfg = cfg.clone();
            switched_cfg.provider = new_provider;
            switched_cfg.model = None;

            match build_chat_runner(&switched_cfg) {
                Ok((new_runner, new_resolved_provider, new_model_name)) => {
                    *runner = new_runner;
                    *resolved_provider = new_resolved_provider;
                    *model_name = new_model_name;
                    telemetry.emit(
                        "chat.provider_switched",
                        json!({
                            "provider": format!("{:?}", resolved_provider).to_ascii_lowercase(),
                            "model": model_name.clone()
                        }),
                    );
                    switched_cfg.provider = *resolved_provider;
                    switched_cfg.model = Some(model_name.clone());
                    *cfg = switched_cfg;
                    tracing::info!(
                        provider = ?resolved_provider,
                        model = %model_name,
                        "Switched model provider"
                    );
                    println!(
                        "Switched provider to {:?} (model={}). Pipeline rebuilt.",
                        resolved_provider, model_name
                    );
                }
                Err(err) => {
                    eprintln!("{}", format_cli_error(&err));
                    println!(
                        "Provider remains {:?} (model={}).",
                        resolved_provider, model_name
                    );
                }
            }

            Ok(ChatCommandAction::Continue)
        }
        ChatCommand::Model(next_model) => {
            let Some(chosen_model) = next_model else {
                println!(
                    "Active model: '{}' on provider {:?}. Use /model <model-id> to switch.",
                    model_name, resolved_provider
                );
                return Ok(ChatCommandAction::Continue);
            };

            let mut switched_cfg = cfg.clone();
            switched_cfg.model = Some(chosen_model);

            match build_chat_runner(&switched_cfg) {
                Ok((new_runner, new_resolved_provider, new_model_name)) => {
                    *runner = new_runner;
                    *resolved_provider = new_resolved_provider;
                    *model_name = new_model_name;
                    telemetry.emit(
                        "chat.model_switched",
                        json!({
                            "provider": format!("{:?}", resolved_provider).to_ascii_lowercase(),
                            "model": model_name.clone()
                        }),
                    );
                    switched_cfg.provider = *resolved_provider;
                    switched_cfg.model = Some(model_name.clone());
                    *cfg = switched_cfg;
                    println!(
                        "Switched model to '{}' on provider {:?}. Pipeline rebuilt.",
                        model_name, resolved_provider
                    );
                }
                Err(err) => {
                    eprintln!("{}", format_cli_error(&err));
                    println!(
                        "Model remains '{}' on provider {:?}.",
                        model_name, resolved_provider
                    );
                }
            }

            Ok(ChatCommandAction::Continue)
        }
    }
}

pub async fn run_chat(mut cfg: RuntimeConfig, telemetry: &TelemetrySink) -> Result<()> {
    let (mut runner, mut resolved_provider, mut model_name) = build_chat_runner(&cfg)?;

    cfg.provider = resolved_provider;
    cfg.model = Some(model_name.clone());

    telemetry.emit(
        "chat.started",
        json!({
            "provider": format!("{:?}", resolved_provider).to_ascii_lowercase(),
            "model": model_name.clone(),
            "profile": cfg.profile.clone()
        }),
    );

    tracing::info!(provider = ?resolved_provider, model = %model_name, "Using model");
    print_chat_banner();

    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("counsel> ");
        io::stdout().flush().context("failed to flush stdout")?;
        line.clear();
        let read = stdin
            .read_line(&mut line)
            .context("failed to read input from stdin")?;
        if read == 0 {
            break; // EOF
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse_chat_command(input) {
            ParsedChatCommand::NotACommand => {}
            ParsedChatCommand::MissingArgument { usage } => {
                println!("Usage: {usage}");
                continue;
            }
            ParsedChatCommand::UnknownCommand(command) => {
                println!("Unknown command '{command}'. Use /help.");
                continue;
            }
            ParsedChatCommand::Command(command) => {
                let action = dispatch_chat_command(
                    command,
                    &mut cfg,
                    &mut runner,
                    &mut resolved_provider,
                    &mut model_name,
                    telemetry,
                )
                .await?;
                if matches!(action, ChatCommandAction::Exit) {
                    break;
                }
                continue;
            }
        }

        match run_workflow_streaming(&runner, input, telemetry).await {
            Ok(_) => {}
            Err(err) => eprintln!("{}", format_cli_error(&err)),
        }
    }

    Ok(())
}
