//! Sova CLI
//!
//! Command-line entry point for the Sova Telegram assistant

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sova_config::{Config, ProviderConfig};
use sova_core::SovaRuntime;
use sova_ipc::{EventBus, Messenger};
use sova_providers::{ChatProvider, ModelRegistry, OpenAICompatibleProvider, RetryPolicy};
use sova_telegram::TelegramAdapter;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const REDACTED: &str = "***REDACTED***";

#[derive(Parser)]
#[command(name = "sova")]
#[command(about = "Telegram AI assistant with model routing, speech and documents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show the model menu as the bot will offer it
    Models,

    /// Test connections and credentials
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },

    /// Log management commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Health check each configured chat backend
    Providers,
}

#[derive(Subcommand)]
enum LogCommands {
    /// Print the log directory
    Path,
    /// Show log files and sizes
    List,
    /// Remove logs older than N days
    Clean {
        #[arg(short, long, default_value = "7")]
        days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = Config::load_or_env(cli.config.as_deref())?;
            config.require_telegram()?;
            let log_level = config
                .core
                .log_level
                .clone()
                .filter(|_| cli.log_level == "info")
                .unwrap_or(cli.log_level);
            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("creating data dir {}", data_dir.display()))?;
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;
            run_bot(config).await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => create_default_config(cli.config, force)?,
            ConfigCommands::Show => match Config::load_or_env(cli.config.as_deref()) {
                Ok(config) => {
                    println!("Current configuration:");
                    print_redacted_config(&config)?;
                }
                Err(e) => eprintln!("Error loading config: {}", e),
            },
            ConfigCommands::Validate => {
                match Config::load_or_env(cli.config.as_deref())
                    .and_then(|config| config.require_telegram().map(|_| config))
                {
                    Ok(_) => println!("Configuration is valid."),
                    Err(e) => eprintln!("Configuration is invalid: {}", e),
                }
            }
        },

        Commands::Models => {
            logging::init_console(&cli.log_level);
            let config = Config::load_or_env(cli.config.as_deref())?;
            print_models(&ModelRegistry::for_config(&config));
        }

        Commands::Test { action } => match action {
            TestCommands::Providers => {
                logging::init_console(&cli.log_level);
                println!("Testing chat backends...\n");
                let config = Config::load_or_env(cli.config.as_deref())?;
                test_providers(&config).await?;
            }
        },

        Commands::Logs { action } => {
            let config = Config::load_or_env(cli.config.as_deref())?;
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
            match action {
                LogCommands::Path => println!("{}", manager.log_dir().display()),
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let removed = manager.cleanup_old_logs(days)?;
                    println!("Cleaned {} old log file(s)", removed);
                }
            }
        }
    }

    Ok(())
}

async fn run_bot(config: Config) -> Result<()> {
    let event_bus = EventBus::new();
    let adapter = Arc::new(
        TelegramAdapter::new(&config.telegram, config.data_dir())?
            .with_event_bus(event_bus.clone()),
    );
    let messenger: Arc<dyn Messenger> = adapter.clone();
    let runtime = SovaRuntime::from_config(&config, messenger, &event_bus)?;

    let poller = tokio::spawn(async move {
        if let Err(e) = adapter.poll().await {
            error!("Telegram polling stopped: {}", e);
        }
    });

    info!("Starting Sova runtime in foreground...");
    tokio::select! {
        result = runtime.run() => result?,
        _ = poller => return Err(anyhow!("Telegram adapter exited")),
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }
    Ok(())
}

fn config_path(config_path: Option<PathBuf>) -> Result<PathBuf> {
    config_path
        .or_else(Config::default_path)
        .ok_or_else(|| anyhow!("cannot determine a config directory; pass --config"))
}

fn create_default_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = config_path(path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, include_str!("../../../config/config.example.toml"))?;

    println!("Configuration created at: {}", path.display());
    println!("\nEdit the file to add your bot token and API keys, or set them in the environment:");
    println!("  BOT_TOKEN, ADMIN_ID, MISTRAL_API_KEY, OPENROUTER_API_KEY, GROQ_API_KEY, TTS_API_KEY");
    Ok(())
}

fn redact(value: &mut serde_json::Value, pointer: &str) {
    if let Some(secret) = value.pointer_mut(pointer) {
        if secret.as_str().is_some_and(|s| !s.is_empty()) {
            *secret = json!(REDACTED);
        }
    }
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    for pointer in [
        "/telegram/bot_token",
        "/providers/primary/api_key",
        "/providers/gateway/api_key",
        "/speech/stt/api_key",
        "/speech/tts/api_key",
    ] {
        redact(&mut value, pointer);
    }
    Ok(value)
}

fn print_redacted_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&redacted_config(config)?)?);
    Ok(())
}

fn print_models(registry: &ModelRegistry) {
    if registry.is_empty() {
        println!("No models available.");
        return;
    }
    println!("Models ({}):\n", registry.entries().len());
    for entry in registry.entries() {
        println!(
            "  {:<40} {:<28} {:?}{}",
            entry.id,
            entry.label,
            entry.route,
            if entry.vision { " [vision]" } else { "" }
        );
    }
}

fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        format!(
            "{}...{}",
            chars[..4].iter().collect::<String>(),
            chars[chars.len() - 4..].iter().collect::<String>()
        )
    } else {
        "***".to_string()
    }
}

async fn test_provider(provider_config: &ProviderConfig, default_base_url: &str, config: &Config) -> bool {
    let base_url = provider_config
        .base_url
        .clone()
        .unwrap_or_else(|| default_base_url.to_string());
    println!("Testing provider '{}'...", provider_config.name);
    println!("  Base URL: {}", base_url);

    let Some(key) = provider_config.usable_api_key() else {
        println!("  API Key: missing or placeholder\n  ✗ Skipped\n");
        return false;
    };
    println!("  API Key: {}", key_preview(key));

    let provider = match OpenAICompatibleProvider::new(
        provider_config.name.clone(),
        key.to_string(),
        base_url,
        RetryPolicy::from_config(&config.retry),
    ) {
        Ok(provider) => provider,
        Err(e) => {
            println!("  ✗ Could not build client: {}\n", e);
            return false;
        }
    };

    match provider.health_check().await {
        Ok(true) => {
            println!("  ✓ OK\n");
            true
        }
        Ok(false) => {
            println!("  ✗ Health check failed\n");
            false
        }
        Err(e) => {
            println!("  ✗ Error: {}\n", e);
            false
        }
    }
}

async fn test_providers(config: &Config) -> Result<()> {
    let mut passed = 0;
    let mut failed = 0;

    let mut targets = vec![(&config.providers.primary, sova_config::DEFAULT_PRIMARY_BASE_URL)];
    if let Some(gateway) = &config.providers.gateway {
        targets.push((gateway, sova_config::DEFAULT_GATEWAY_BASE_URL));
    }

    for (provider_config, default_base_url) in targets {
        if test_provider(provider_config, default_base_url, config).await {
            passed += 1;
        } else {
            failed += 1;
        }
    }

    println!("Results: {} passed, {} failed", passed, failed);
    if failed > 0 {
        anyhow::bail!("{} provider(s) failed", failed);
    }
    Ok(())
}
