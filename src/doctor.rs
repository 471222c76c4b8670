use anyhow::Result;

use crate::config::RuntimeConfig;
use crate::pipeline::build_advisory_pipeline;
use crate::provider::{detect_provider, env_present, resolve_model};

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("COUNSEL_ENDPOINT", env_present("COUNSEL_ENDPOINT")),
        ("COUNSEL_MODEL", env_present("COUNSEL_MODEL")),
        ("COUNSEL_API_KEY", env_present("COUNSEL_API_KEY")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {:?}", provider),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export OPENAI_API_KEY, or COUNSEL_ENDPOINT for a local endpoint");
        }
    }

    println!(
        "Endpoint override: {}",
        cfg.endpoint.as_deref().unwrap_or("<provider-default>")
    );
    println!(
        "Model override: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!(
        "Stage timeout: {}",
        cfg.stage_timeout_secs
            .map(|secs| format!("{secs}s"))
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    match resolve_model(cfg) {
        Ok((model, provider, model_name)) => {
            println!(
                "Model resolution: ok (provider={:?}, model={})",
                provider, model_name
            );
            let workflow = build_advisory_pipeline(model)?;
            println!(
                "Pipeline check: ok ({} stages: {})",
                workflow.stage_count(),
                workflow.traversal_order().join(" → ")
            );
        }
        Err(err) => {
            println!("Model resolution: failed ({err:#})");
            println!("The pipeline cannot run until a provider is configured.");
        }
    }

    Ok(())
}
