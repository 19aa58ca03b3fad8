use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use tomo_adapters::{AdapterError, LlmGateway};
use tomo_core::config::parse_model_id;
use tomo_core::{
    AppConfig, BookPipeline, BookRequest, ConfigError, LogLevel, LoggingObserver, PipelineError,
    PromptRegistry, PromptError, StateManager, StdoutLogSink,
};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Providers => run_providers(),
    }
}

fn run_generate(args: GenerateArgs) -> Result<(), CliError> {
    let mut config = AppConfig::load()?;
    if let Some(model) = &args.model {
        apply_model_override(&mut config, model);
    }

    let prompts = match &args.prompt_dir {
        Some(dir) => PromptRegistry::with_custom_directories(&[dir])?,
        None => PromptRegistry::new()?,
    };

    let mut request = BookRequest::from_config(&config);
    if let Some(subject) = args.subject {
        request.subject = subject;
    }
    if let Some(profile) = args.profile {
        request.profile = profile;
    }
    if let Some(style) = args.style {
        request.style = style;
    }
    if let Some(genre) = args.genre {
        request.genre = genre;
    }
    if let Some(format) = args.format {
        request.output_format = format;
    }
    if let Some(output) = args.output {
        request.output_dir = output;
    }

    let sink = StdoutLogSink::with_min_level(if args.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    let gateway = LlmGateway::from_config(&config)?;
    println!("Provider chain: {}", gateway.provider_names().join(" -> "));

    let states = StateManager::default();
    states.add_observer(Arc::new(LoggingObserver::new(Arc::new(
        StdoutLogSink::new(),
    ))));

    let pipeline = BookPipeline::new(&prompts, &sink, &config);
    let artifact = pipeline.run(&gateway, &states, &request, None)?;

    println!();
    println!("Book complete: {}", artifact.title);
    println!("Saved at: {}", artifact.path.display());
    for warning in &artifact.ordering_warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

fn run_providers() -> Result<(), CliError> {
    let config = AppConfig::load()?;
    println!("Fail-over chain (configured providers marked with *):");
    for name in &config.providers.chain {
        let configured = config
            .providers
            .get(name)
            .map(|settings| settings.is_configured())
            .unwrap_or(false);
        let model = config.providers.model_for(name).unwrap_or_default();
        let mark = if configured { "*" } else { " " };
        println!("  {mark} {name}  {model}");
    }
    Ok(())
}

/// `--model provider:model` reorders the chain so the requested provider is
/// tried first, and pins its model when one is given.
fn apply_model_override(config: &mut AppConfig, value: &str) {
    let (provider, model) = parse_model_id(value);
    config.providers.chain.retain(|name| name != &provider);
    config.providers.chain.insert(0, provider.clone());
    config.providers.selected_provider = Some(provider);
    if model.is_some() {
        config.providers.selected_model = model;
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("prompt registry error: {0}")]
    Prompts(#[from] PromptError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("generation failed: {0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Parser)]
#[command(
    name = "tomoctl",
    version,
    about = "LLM-driven long-form book generator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a complete book from a subject description
    Generate(GenerateArgs),
    /// Show the provider fail-over chain resolved from the environment
    Providers,
}

#[derive(Args)]
struct GenerateArgs {
    /// Subject of the book (defaults to GEN_DEFAULT_SUBJECT)
    #[arg(long)]
    subject: Option<String>,

    /// Reader/book profile
    #[arg(long)]
    profile: Option<String>,

    /// Writing style
    #[arg(long)]
    style: Option<String>,

    /// Genre
    #[arg(long)]
    genre: Option<String>,

    /// Provider to use, as `provider` or `provider:model` (e.g. ollama:llama3)
    #[arg(long)]
    model: Option<String>,

    /// Output format for the final document
    #[arg(long)]
    format: Option<String>,

    /// Output directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Directory with prompt template overrides (TOML/YAML)
    #[arg(long)]
    prompt_dir: Option<PathBuf>,

    /// Verbose progress output
    #[arg(long, short)]
    verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_env_config() -> AppConfig {
        AppConfig::from_lookup(&|_key| None)
    }

    #[test]
    fn model_override_moves_provider_to_front() {
        let mut config = empty_env_config();
        apply_model_override(&mut config, "ollama:llama3");
        assert_eq!(
            config.providers.chain.first().map(String::as_str),
            Some("ollama")
        );
        assert_eq!(
            config.providers.model_for("ollama"),
            Some("llama3".to_string())
        );
    }

    #[test]
    fn bare_provider_override_keeps_configured_model() {
        let mut config = empty_env_config();
        if let Some(settings) = config.providers.settings.get_mut("groq") {
            settings.model = "llama3-8b-8192".to_string();
        }
        apply_model_override(&mut config, "groq");
        assert_eq!(
            config.providers.chain.first().map(String::as_str),
            Some("groq")
        );
        assert_eq!(
            config.providers.model_for("groq"),
            Some("llama3-8b-8192".to_string())
        );
    }
}
