use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use storyforge_agent::Engine;
use storyforge_core::config::{Config, LoggingConfig};
use storyforge_core::protocol::EventType;
use storyforge_core::scenario::Scenario;
use storyforge_core::types::{Action, AgentRequest, Operation, Target, Turn};
use storyforge_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "storyforge",
    about = "Conversational story-scenario agent: chat with it or serve it over HTTP",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Send one request to the agent
    Chat {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Scenario JSON file to work on
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Conversation history JSON file (array of turns)
        #[arg(long)]
        history: Option<PathBuf>,

        #[arg(long, default_value = "cli")]
        user_id: String,

        /// Skip classification and run this action directly
        #[arg(long, requires = "target")]
        action: Option<String>,

        /// Target for --action
        #[arg(long, requires = "action")]
        target: Option<String>,

        /// Write the resulting scenario here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is running
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value (dotted path, e.g. engine.max_tokens)
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Chat {
            message,
            scenario,
            history,
            user_id,
            action,
            target,
            out,
        } => {
            let mut request = AgentRequest::new(user_id, message);
            if let Some(path) = scenario {
                request.scenario = Some(read_json::<Scenario>(&path)?);
            }
            if let Some(path) = history {
                request.conversation_history = read_json::<Vec<Turn>>(&path)?;
            }
            if let (Some(action), Some(target)) = (action, target) {
                request.operations = Some(vec![precommitted(&action, &target, &request.user_input)?]);
            }
            chat(&config, request, out.as_deref()).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over the config file;
/// `--verbose` wins over both.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let mut directives = logging
        .and_then(|l| l.level.clone())
        .unwrap_or_else(|| "info".to_string());
    for filter in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(filter);
    }

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    let json = logging.is_some_and(|l| l.format == "json");
    let to_stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, to_stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let engine = Arc::new(Engine::from_config(&config)?);
    tracing::info!(
        provider = engine.provider_id(),
        model = %engine.settings().model,
        "Starting Storyforge gateway on port {port}"
    );

    let state = GatewayState::new(Arc::new(config), engine);
    #[cfg(feature = "metrics")]
    let state = state.with_prometheus(storyforge_gateway::metrics::install_prometheus_recorder()?);

    storyforge_gateway::start_gateway(Arc::new(state), port).await
}

/// Run one request, printing chat deltas as they arrive.
async fn chat(config: &Config, request: AgentRequest, out: Option<&Path>) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(config)?);
    let mut handle = engine.spawn(request);

    let mut stdout = std::io::stdout();
    let mut mid_line = false;
    while let Some(event) = handle.events.recv().await {
        match event.event_type {
            EventType::Chat => {
                print!("{}", event.content);
                stdout.flush()?;
                mid_line = !event.content.ends_with('\n');
            }
            EventType::Status => eprintln!("[{}]", event.content),
            EventType::Error => eprintln!("error: {}", event.content),
            EventType::ToolCall => tracing::debug!(action = %event.content, "Tool call"),
            EventType::Completion => {}
        }
    }
    if mid_line {
        println!();
    }

    let outcome = handle.outcome.await.context("agent run failed")?;
    if let Some(err) = &outcome.error {
        eprintln!("error: {err}");
    }
    for question in &outcome.follow_up_questions {
        eprintln!("  > {question}");
    }

    if outcome.scenario_changed {
        if let Some(scenario) = &outcome.scenario {
            let json = serde_json::to_string_pretty(scenario)?;
            match out {
                Some(path) => {
                    std::fs::write(path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("Scenario written to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }
    Ok(())
}

async fn status(config: &Config, config_path: &Path) {
    println!("Storyforge v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!(
        "Provider: {}",
        config.first_provider().map(|p| p.id.as_str()).unwrap_or("(none)")
    );
    println!("Model: {}", config.default_model());
    println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());

    let url = format!(
        "http://{}:{}/health",
        config.gateway_bind(),
        config.gateway_port()
    );
    let health = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => match client.get(&url).send().await {
            Ok(resp) => resp.json::<serde_json::Value>().await.ok(),
            Err(_) => None,
        },
        Err(_) => None,
    };
    match health {
        Some(body) => println!(
            "Status: running (busy: {}, runs: {})",
            body["busy"], body["runs"]
        ),
        None => println!("Status: not running"),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn precommitted(action: &str, target: &str, prompt: &str) -> anyhow::Result<Operation> {
    let action = Action::parse(action).with_context(|| format!("unknown action '{action}'"))?;
    let target = Target::parse(target).with_context(|| format!("unknown target '{target}'"))?;
    Ok(Operation::new(action, target, prompt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_args_parse() {
        let cli = Cli::try_parse_from([
            "storyforge",
            "chat",
            "-m",
            "add a pirate",
            "--action",
            "creation",
            "--target",
            "character",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat {
                message,
                action,
                target,
                user_id,
                ..
            } => {
                assert_eq!(message, "add a pirate");
                assert_eq!(action.as_deref(), Some("creation"));
                assert_eq!(target.as_deref(), Some("character"));
                assert_eq!(user_id, "cli");
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_action_requires_target() {
        assert!(Cli::try_parse_from(["storyforge", "chat", "-m", "x", "--action", "creation"]).is_err());
    }

    #[test]
    fn test_precommitted_operation() {
        let op = precommitted("modification", "backstory", "darker please").unwrap();
        assert_eq!(op.action, Action::Modification);
        assert_eq!(op.target, Target::Backstory);
        assert_eq!(op.prompt, "darker please");
        assert!(precommitted("delete", "character", "x").is_err());
    }
}
