use clap::ValueEnum;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::model::ChatModel;
use crate::openai::{OpenAiChatModel, OpenAiConfig};

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
// Local OpenAI-compatible endpoints commonly accept any non-empty key.
const LOCAL_PLACEHOLDER_KEY: &str = "nokey";

pub fn validate_model_for_provider(provider: Provider, model_name: &str) -> Result<()> {
    let is_valid = match provider {
        Provider::Openai => {
            model_name.starts_with("gpt-")
                || model_name.starts_with("o1")
                || model_name.starts_with("o3")
                || model_name.starts_with("o4")
        }
        Provider::Local => !model_name.trim().is_empty(),
        Provider::Auto => true,
    };

    if is_valid {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "model '{}' is not compatible with provider '{:?}'",
        model_name,
        provider
    ))
}

/// Build the shared chat model all three pipeline stages run against.
/// Missing endpoint or credentials fail here, before any run begins.
pub fn resolve_model(cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Provider, String)> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set OPENAI_API_KEY, or set COUNSEL_ENDPOINT \
             to an OpenAI-compatible endpoint and use --provider local",
        )?,
        p => p,
    };

    match provider {
        Provider::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is required for OpenAI provider")?;
            let endpoint = cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_ENDPOINT.to_string());
            let model_name = cfg
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string());
            validate_model_for_provider(provider, &model_name)?;
            let model = OpenAiChatModel::new(
                OpenAiConfig::new(endpoint, model_name.clone()).with_api_key(api_key),
            )?;
            Ok((Arc::new(model), provider, model_name))
        }
        Provider::Local => {
            let endpoint = cfg
                .endpoint
                .clone()
                .or_else(|| std::env::var("COUNSEL_ENDPOINT").ok())
                .filter(|value| !value.trim().is_empty())
                .context(
                    "no model endpoint configured. Set COUNSEL_ENDPOINT or pass --endpoint \
                     for the local provider",
                )?;
            let model_name = cfg
                .model
                .clone()
                .or_else(|| std::env::var("COUNSEL_MODEL").ok())
                .filter(|value| !value.trim().is_empty())
                .context(
                    "no model identifier configured. Set COUNSEL_MODEL or pass --model \
                     for the local provider",
                )?;
            validate_model_for_provider(provider, &model_name)?;
            let api_key = std::env::var("COUNSEL_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| LOCAL_PLACEHOLDER_KEY.to_string());
            let model = OpenAiChatModel::new(
                OpenAiConfig::new(endpoint, model_name.clone()).with_api_key(api_key),
            )?;
            Ok((Arc::new(model), provider, model_name))
        }
        Provider::Auto => unreachable!("auto provider must be resolved before matching"),
    }
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("COUNSEL_ENDPOINT") {
        return Some(Provider::Local);
    }
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    Provider::from_str(value, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, openai, local",
            value
        )
    })
}
