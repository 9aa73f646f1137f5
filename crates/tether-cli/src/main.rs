mod host;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use serde_json::Value;
use tether_core::{config::Config, plugin::methods, SettingsStore, ShimPlugin};
use tether_plugin_sdk::{Plugin, PluginManifest};
use tokio::io::BufReader;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tether", author, version, about = "Backend process shim for host plugins")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file; paths not set there fall back to TETHER_* variables.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the plugin, start the backend and serve JSON-line requests on stdin.
    Run,
    /// Inspect or edit the settings file without starting the backend.
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Interact with configuration files (validate, sample output).
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect a plugin.json manifest.
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag,
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Prints the whole settings document.
    Show,
    /// Prints one value, or the default when the key is unset.
    Get {
        key: String,
        #[arg(long, value_name = "JSON", default_value = "null")]
        default: String,
    },
    /// Sets one value and commits. VALUE is parsed as JSON, else stored as a string.
    Set { key: String, value: String },
    /// Removes one key and commits.
    Remove { key: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum ManifestCommands {
    /// Validates and summarizes a manifest (file or plugin directory).
    Show {
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run => handle_run(cli.config.as_deref()).await,
        Commands::Settings { command } => handle_settings(cli.config.as_deref(), command),
        Commands::Config { command } => handle_config(command),
        Commands::Manifest { command } => handle_manifest(command),
        Commands::Diag => handle_diag(cli.config.as_deref()),
    }
}

// stdout carries RPC responses, so logs go to stderr.
fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(anyhow::Error::msg)?;
    Ok(())
}

async fn handle_run(config_path: Option<&Path>) -> Result<()> {
    let resolved = load_config(config_path)?.resolve()?;
    tracing::info!(
        plugin = %resolved.name,
        version = tether_core::version(),
        settings = %resolved.settings_path.display(),
        "loading plugin"
    );
    let plugin = ShimPlugin::new(resolved);

    if let Err(err) = plugin.on_load().await {
        tracing::error!(error = %err, "backend unavailable; serving settings only");
    }
    tracing::info!(methods = ?methods::ALL, "ready for requests on stdin");

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };
    let mut stdout = tokio::io::stdout();
    let served = host::serve(&plugin, BufReader::new(tokio::io::stdin()), &mut stdout, shutdown).await;

    // Unload even when the request loop failed.
    if let Err(err) = plugin.on_unload().await {
        tracing::error!(error = %err, "unload failed");
    }
    let served = served?;
    tracing::info!(served, "plugin unloaded");
    Ok(())
}

fn handle_settings(config_path: Option<&Path>, command: SettingsCommands) -> Result<()> {
    let resolved = load_config(config_path)?.resolve()?;
    let mut store = SettingsStore::new(&resolved.settings_path);
    store
        .try_read()
        .with_context(|| format!("refusing to edit {}", resolved.settings_path.display()))?;

    match command {
        SettingsCommands::Show => {
            println!("{}", serde_json::to_string_pretty(store.document())?);
        }
        SettingsCommands::Get { key, default } => {
            let default = serde_json::from_str(&default)
                .with_context(|| format!("--default must be JSON, got `{default}`"))?;
            println!("{}", store.get_setting(&key, default));
        }
        SettingsCommands::Set { key, value } => {
            let value = parse_value(&value);
            store.set_setting(key, value);
            store.commit()?;
        }
        SettingsCommands::Remove { key } => {
            if store.remove_setting(&key).is_none() {
                println!("`{key}` was not set");
                return Ok(());
            }
            store.commit()?;
        }
    }
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(Some(&config))?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../config/example.toml"));
        }
    }
    Ok(())
}

fn handle_manifest(command: ManifestCommands) -> Result<()> {
    match command {
        ManifestCommands::Show { path } => {
            let manifest = load_manifest(&path)?;
            manifest.validate()?;
            println!(
                "{}{}{}",
                manifest.name,
                manifest
                    .version
                    .as_ref()
                    .map(|v| format!(" v{v}"))
                    .unwrap_or_default(),
                manifest
                    .author
                    .as_ref()
                    .map(|a| format!(" by {a}"))
                    .unwrap_or_default()
            );
            if let Some(description) = &manifest.description {
                println!("  {description}");
            }
            println!("  api version: {}", manifest.api_version);
            if !manifest.flags.is_empty() {
                println!("  flags: {}", manifest.flags.join(", "));
            }
            if let Some(backend) = &manifest.backend {
                println!("  backend: {backend}");
            }
        }
    }
    Ok(())
}

fn handle_diag(config_path: Option<&Path>) -> Result<()> {
    let resolved = load_config(config_path)?.resolve()?;
    let json = serde_json::to_string_pretty(&resolved)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::from_env());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let mut cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    cfg.apply_env();
    Ok(cfg)
}

fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let file = if path.is_dir() {
        path.join("plugin.json")
    } else {
        path.to_path_buf()
    };
    let data = fs::read_to_string(&file)
        .with_context(|| format!("failed to read manifest {}", file.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse manifest {}", file.display()))
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
